//! # Compaction
//!
//! Reconciling overlapping table versions into fewer tables:
//!
//! - [`merge`] — the k-way atom merge and the streaming shadow/purge
//!   filter.
//! - [`CompactionController`] — per-compaction context: the overlap
//!   interval tree, `gc_before`, the [`CompactionController::should_purge`]
//!   predicate and the row-materialisation policy.
//! - [`CompactedRow`] — either fully merged in memory
//!   ([`CompactedRow::Precompacted`]) or streamed in two passes
//!   ([`CompactedRow::Lazy`]) when the merged row would exceed the
//!   in-memory compaction limit.
//! - [`leveled`] — the level manifest, candidate selection and the
//!   positional validation scanner.
//!
//! ## Purge safety
//!
//! A tombstone may be dropped only when every older version of its
//! partition is part of the compaction set. `should_purge` consults the
//! interval tree of all live tables *outside* the set: any such table
//! with `min_timestamp` at or below the row's max deletion timestamp
//! whose filter admits the key forces the tombstones to be preserved.

#[cfg(test)]
mod tests;

pub mod leveled;
pub mod merge;

use std::io;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::row::{
    Atom, ClusteringComparator, ColumnStats, DecoratedKey, DeletionTime, RowData, Token,
};
use crate::sstable::{
    writer::promoted_blocks, RowView, SSTableError, SSTableReader, SSTableWriter,
};
use crate::stats::StreamingHistogram;
use crate::store::SecondaryIndexes;
use crate::tracker::{IntervalTree, RowCache, View};

use merge::{merge_into_row, MergedAtomStream, PurgedAtomStream};

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction tasks.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// A table read or write failed.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Underlying I/O failure outside table components.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The compaction observed its cancel flag between rows.
    #[error("compaction cancelled")]
    Cancelled,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Controller
// ------------------------------------------------------------------------------------------------

/// Per-compaction context over one input set.
pub struct CompactionController {
    comparator: ClusteringComparator,
    /// Tombstones with a local deletion time below this are candidates
    /// for purge.
    pub gc_before: i32,
    /// Counter shards with clocks below this are safe to merge away:
    /// the oldest unflushed memtable's creation time (seconds) plus a
    /// five-hour safety window.
    pub merge_shard_before: i64,
    overlapping: Vec<Arc<SSTableReader>>,
    overlap_tree: IntervalTree,
    row_cache: Option<Arc<RowCache>>,
    in_memory_compaction_limit: u64,
    commutative: bool,
}

impl CompactionController {
    /// Builds the controller for `inputs`, referencing every live table
    /// outside the set whose token range intersects the inputs' union.
    pub fn new(
        view: &View,
        inputs: &[Arc<SSTableReader>],
        gc_before: i32,
        oldest_unflushed_secs: u64,
        comparator: ClusteringComparator,
        row_cache: Option<Arc<RowCache>>,
        in_memory_compaction_limit: u64,
        commutative: bool,
    ) -> Self {
        let mut range: Option<(Token, Token)> = None;
        for reader in inputs {
            let (first, last) = reader.token_range();
            range = Some(match range {
                None => (first, last),
                Some((s, e)) => (s.min(first), e.max(last)),
            });
        }
        let input_gens: Vec<u64> = inputs.iter().map(|r| r.generation()).collect();
        let overlapping: Vec<Arc<SSTableReader>> = match range {
            None => Vec::new(),
            Some((start, end)) => view
                .overlapping(start, end)
                .into_iter()
                .filter(|reader| !input_gens.contains(&reader.generation()))
                .collect(),
        };
        let overlap_tree = IntervalTree::build(&overlapping);
        debug!(
            inputs = inputs.len(),
            overlapping = overlapping.len(),
            gc_before,
            "compaction controller ready"
        );
        Self {
            comparator,
            gc_before,
            merge_shard_before: oldest_unflushed_secs as i64 + 5 * 3600,
            overlapping,
            overlap_tree,
            row_cache,
            in_memory_compaction_limit,
            commutative,
        }
    }

    /// A controller with no overlap set, for tasks that never purge
    /// (validation scans, scrub-like rewrites).
    pub fn without_overlaps(
        comparator: ClusteringComparator,
        gc_before: i32,
        in_memory_compaction_limit: u64,
    ) -> Self {
        Self {
            comparator,
            gc_before,
            merge_shard_before: i64::MIN,
            overlapping: Vec::new(),
            overlap_tree: IntervalTree::build(&[]),
            row_cache: None,
            in_memory_compaction_limit,
            commutative: false,
        }
    }

    /// True when it is safe to drop tombstones for `key`: no table
    /// outside the compaction set may hold an older version of the row.
    ///
    /// A table blocks the purge when its `min_timestamp` is at or below
    /// `max_deletion_timestamp` and its bloom filter admits the key; a
    /// table without a usable filter falls back to an index lookup.
    pub fn should_purge(
        &self,
        key: &DecoratedKey,
        max_deletion_timestamp: i64,
    ) -> Result<bool, SSTableError> {
        for reader in self.overlap_tree.containing(key.token) {
            if reader.metadata.min_timestamp > max_deletion_timestamp {
                continue;
            }
            if reader.filter_is_always_present() {
                if reader.key_is_present(key)? {
                    trace!(generation = reader.generation(), "purge blocked via index");
                    return Ok(false);
                }
            } else if reader.may_contain(&key.key) {
                trace!(generation = reader.generation(), "purge blocked via filter");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drops the cached row for a key being rewritten.
    pub fn invalidate_cached_row(&self, key: &DecoratedKey) {
        if let Some(cache) = &self.row_cache {
            cache.invalidate(&key.key);
        }
    }

    /// Picks the materialisation for one partition's fragments: fully
    /// in-memory below the in-memory compaction limit, streamed above it.
    pub fn compacted_row(
        &self,
        fragments: Vec<RowView>,
        indexer: &dyn SecondaryIndexes,
    ) -> Result<Option<CompactedRow>, CompactionError> {
        let Some(first) = fragments.first() else {
            return Ok(None);
        };
        let key = first.key.clone();
        self.invalidate_cached_row(&key);

        let row_size: u64 = fragments.iter().map(|f| f.data_size).sum();
        if row_size > self.in_memory_compaction_limit {
            debug!(
                key_len = key.key.len(),
                row_size, "compacting large row incrementally"
            );
            return Ok(Some(self.lazy_row(key, fragments)?));
        }

        let deletions: Vec<DeletionTime> = fragments.iter().map(|f| f.deletion).collect();
        let cursors = fragments.iter().map(|f| f.atoms()).collect();
        let mut row = merge_into_row(&self.comparator, &key, &deletions, cursors, Some(indexer))?;

        let mut purge = false;
        if row.has_irrelevant_data(self.gc_before) {
            purge = self.should_purge(&key, row.max_timestamp())?;
        }
        row.remove_deleted(
            &self.comparator,
            if purge { self.gc_before } else { i32::MIN },
        );
        if self.commutative && purge {
            row.remove_old_shards(self.merge_shard_before);
        }

        if row.is_empty() && row.deletion.is_live() {
            return Ok(None);
        }
        Ok(Some(CompactedRow::Precompacted { key, row }))
    }

    fn lazy_row(
        &self,
        key: DecoratedKey,
        fragments: Vec<RowView>,
    ) -> Result<CompactedRow, CompactionError> {
        let mut top = DeletionTime::LIVE;
        let mut max_deletion_ts = i64::MIN;
        for fragment in &fragments {
            if fragment.deletion.marked_for_delete_at > top.marked_for_delete_at {
                top = fragment.deletion;
            }
            max_deletion_ts = max_deletion_ts.max(fragment.deletion.marked_for_delete_at);
        }
        let purge = self.should_purge(&key, max_deletion_ts)?;
        Ok(CompactedRow::Lazy(LazilyCompactedRow {
            key,
            fragments,
            top,
            purge,
            gc_before: self.gc_before,
            merge_shard_before: self.commutative.then_some(self.merge_shard_before),
            comparator: self.comparator,
        }))
    }

    /// Releases the references taken on the overlapping tables.
    pub fn close(self) {
        drop(self.overlapping);
    }
}

// ------------------------------------------------------------------------------------------------
// Compacted rows
// ------------------------------------------------------------------------------------------------

/// The merged form of one partition across the compaction inputs.
pub enum CompactedRow {
    /// Merged fully in memory.
    Precompacted { key: DecoratedKey, row: RowData },
    /// Streamed in two passes, bounded by one index block of memory.
    Lazy(LazilyCompactedRow),
}

impl CompactedRow {
    /// The partition key.
    pub fn key(&self) -> &DecoratedKey {
        match self {
            CompactedRow::Precompacted { key, .. } => key,
            CompactedRow::Lazy(lazy) => &lazy.key,
        }
    }

    /// Writes the row to `writer`, returning its index entry — `None`
    /// when the row turned out empty and nothing was written (only
    /// possible for the lazy form; the precompacted path filters empty
    /// rows earlier).
    pub fn write(
        &self,
        writer: &mut SSTableWriter,
    ) -> Result<Option<crate::sstable::RowIndexEntry>, CompactionError> {
        match self {
            CompactedRow::Precompacted { key, row } => Ok(Some(writer.append(key, row)?)),
            CompactedRow::Lazy(lazy) => lazy.write(writer),
        }
    }

    /// Digest of the merged row: `deletion ∥ column count ∥ cells`, in
    /// clustering order.
    pub fn update_digest(&self, hasher: &mut Sha256) -> Result<(), CompactionError> {
        match self {
            CompactedRow::Precompacted { row, .. } => {
                row.update_digest(hasher);
                Ok(())
            }
            CompactedRow::Lazy(lazy) => lazy.update_digest(hasher),
        }
    }
}

/// A merged row too large to hold in memory: the merge is re-run per
/// pass — one pass to size the row and build its column index, one to
/// write atoms — so peak memory stays at one block.
pub struct LazilyCompactedRow {
    key: DecoratedKey,
    fragments: Vec<RowView>,
    top: DeletionTime,
    purge: bool,
    gc_before: i32,
    merge_shard_before: Option<i64>,
    comparator: ClusteringComparator,
}

struct LazyFirstPass {
    atom_count: u32,
    atoms_len: u64,
    boundaries: Vec<(Vec<u8>, u64, u64)>,
    stats: ColumnStats,
    emitted_top: DeletionTime,
}

impl LazilyCompactedRow {
    fn stream<'a>(
        &'a self,
        indexer: Option<&'a dyn SecondaryIndexes>,
    ) -> Result<PurgedAtomStream<'a>, SSTableError> {
        let cursors = self.fragments.iter().map(|f| f.atoms()).collect();
        let inner = MergedAtomStream::new(self.comparator, cursors, &self.key, indexer)?;
        Ok(PurgedAtomStream::new(
            inner,
            self.comparator,
            self.top,
            self.purge,
            self.gc_before,
            self.merge_shard_before,
        ))
    }

    fn first_pass(&self) -> Result<LazyFirstPass, CompactionError> {
        let mut stream = self.stream(None)?;
        let emitted_top = stream.output_deletion();

        let mut atom_count = 0u32;
        let mut atoms_len = 0u64;
        let mut boundaries = Vec::new();
        let mut column_count = 0u64;
        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        let mut histogram = StreamingHistogram::default_tombstone_drop_time();

        if !emitted_top.is_live() {
            min_timestamp = min_timestamp.min(emitted_top.marked_for_delete_at);
            max_timestamp = max_timestamp.max(emitted_top.marked_for_delete_at);
            histogram.update(emitted_top.local_deletion_time as f64);
        }

        while let Some(atom) = stream.next_atom()? {
            let size = atom.serialized_size();
            boundaries.push((atom.name().to_vec(), atoms_len, atoms_len + size));
            atoms_len += size;
            atom_count += 1;
            match &atom {
                Atom::Cell(cell) => {
                    column_count += 1;
                    min_timestamp = min_timestamp.min(cell.timestamp());
                    max_timestamp = max_timestamp.max(cell.timestamp());
                    if cell.local_deletion_time() != i32::MAX {
                        histogram.update(cell.local_deletion_time() as f64);
                    }
                }
                Atom::Range(rt) => {
                    min_timestamp = min_timestamp.min(rt.timestamp);
                    max_timestamp = max_timestamp.max(rt.timestamp);
                    histogram.update(rt.local_deletion_time as f64);
                }
            }
        }

        Ok(LazyFirstPass {
            atom_count,
            atoms_len,
            boundaries,
            stats: ColumnStats {
                column_count,
                min_timestamp,
                max_timestamp,
                tombstone_histogram: histogram,
            },
            emitted_top,
        })
    }

    fn write(
        &self,
        writer: &mut SSTableWriter,
    ) -> Result<Option<crate::sstable::RowIndexEntry>, CompactionError> {
        let first = self.first_pass()?;
        if first.atom_count == 0 && first.emitted_top.is_live() {
            return Ok(None);
        }

        let promoted = promoted_blocks(
            &first.boundaries,
            first.atoms_len,
            writer.column_index_size(),
        );

        let mut stream = self.stream(None)?;
        let atoms = std::iter::from_fn(move || stream.next_atom().transpose());
        let entry = writer.append_stream(
            &self.key,
            first.emitted_top,
            first.atom_count,
            first.atoms_len,
            &promoted,
            atoms,
            &first.stats,
        )?;
        Ok(Some(entry))
    }

    /// Mirrors [`RowData::update_digest`] byte for byte: deletion info
    /// (top plus range tombstones) first, then the cell count, then the
    /// cells. Ranges and cells interleave in the merged stream, so the
    /// merge is re-run once per section.
    fn update_digest(&self, hasher: &mut Sha256) -> Result<(), CompactionError> {
        let mut stream = self.stream(None)?;
        let top = stream.output_deletion();
        hasher.update(top.marked_for_delete_at.to_le_bytes());
        hasher.update(top.local_deletion_time.to_le_bytes());

        let mut cells: u32 = 0;
        while let Some(atom) = stream.next_atom()? {
            match atom {
                Atom::Cell(_) => cells += 1,
                Atom::Range(rt) => {
                    hasher.update(&rt.start);
                    hasher.update(&rt.end);
                    hasher.update(rt.timestamp.to_le_bytes());
                }
            }
        }
        hasher.update(cells.to_le_bytes());

        let mut stream = self.stream(None)?;
        while let Some(atom) = stream.next_atom()? {
            if let Atom::Cell(cell) = atom {
                cell.update_digest(hasher);
            }
        }
        Ok(())
    }
}
