//! # StrataDB
//!
//! An embeddable **single-table log-structured storage engine** for a
//! wide-column data model: writes land in a concurrent in-memory sorted
//! buffer, flush atomically into immutable sorted on-disk tables, and
//! reconcile through size-leveled background compaction that honours
//! deletion semantics and purge safety.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ColumnFamilyStore                        │
//! │  ┌────────────┐   ┌───────────────┐   ┌──────────────────┐  │
//! │  │   Active   │   │   Flushing    │   │  Sorted tables   │  │
//! │  │  memtable  │──►│   memtables   │──►│  L0 ─► L1 ─► …   │  │
//! │  └────────────┘   └───────────────┘   └──────────────────┘  │
//! │        switch            flush              compaction      │
//! │                                                             │
//! │  DataTracker — atomically swapped snapshots of the live set │
//! │  LeveledManifest — non-overlapping levels, size targets     │
//! │  Executors — bounded flush/compaction pools, commit-log     │
//! │              ordered flush signals                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`row`] | Wide-column data model: keys, tokens, cells, tombstones, reconciliation |
//! | [`stats`] | Histograms and the commit-log replay position |
//! | [`encoding`] | Byte-stable wire format for every durable structure |
//! | [`memtable`] | Concurrent write buffer with slab accounting and live-size estimation |
//! | [`sstable`] | Immutable sorted tables: writer, reader, promoted row index, sidecar |
//! | [`compaction`] | Merge/purge machinery and the leveled manifest |
//! | [`tracker`] | Live-set snapshots, reference-counted table lifecycle, caches |
//! | [`executor`] | Bounded pools and the commit-log-order flush signaller |
//! | [`store`] | The owning facade: write path, collating reads, flush, compaction |
//!
//! ## Guarantees
//!
//! - **Last-writer-wins reconciliation** with deterministic tie-breaks,
//!   across any interleaving of writes, flushes and compactions.
//! - **Delete preservation**: write paths never drop a tombstone;
//!   compaction purges one only when no table outside the compaction
//!   set could still hold shadowed data.
//! - **Level invariants**: tables in every level above L0 are pairwise
//!   key-disjoint, re-verified after every manifest mutation.
//! - **Abortable writes**: a failed or abandoned table writer leaves no
//!   visible files; the TOC is the commit point.
//! - **Commit-log ordering**: flush completions are signalled in
//!   monotone replay-position order regardless of completion order.

pub mod compaction;
pub mod encoding;
pub mod executor;
pub mod memtable;
pub mod row;
pub mod sstable;
pub mod stats;
pub mod store;
pub mod tracker;

pub use row::{
    Cell, ClusteringComparator, CounterShard, DecoratedKey, DeletionInfo, DeletionTime,
    HashPartitioner, OrderPreservingPartitioner, Partitioner, QueryFilter, RangeTombstone, Row,
    RowData, Token,
};
pub use stats::ReplayPosition;
pub use store::{
    ColumnFamilyStore, CommitLog, NoopCommitLog, NullIndexes, SecondaryIndexes, StoreConfig,
    SystemContext,
};
