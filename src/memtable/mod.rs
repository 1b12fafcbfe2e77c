//! # Memtable
//!
//! The mutable in-memory write buffer preceding a flush: a concurrent
//! sorted map of [`DecoratedKey`] → row, with region-granular slab
//! accounting and a serialized-size estimate maintained on every write.
//!
//! ## Concurrency contract
//!
//! A memtable is *active*, *flushing*, or *done*; the owning store's
//! switch lock guarantees writes only reach the active memtable (writers
//! hold it for read, the memtable switch holds it for write). Within the
//! memtable, first insertion of a key is a compare-and-set on the skip
//! map — losing the race means merging into the winner's row — and cell
//! merges run under the row's own lock.
//!
//! ## Size accounting
//!
//! `current_size` tracks the serialized byte estimate of everything
//! written. The true heap footprint is `current_size * live_ratio`,
//! where the live ratio is calibrated asynchronously by the store's
//! metering task; the slab allocator's minimum footprint is a hard lower
//! bound on the estimate.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_skiplist::SkipMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::row::{Cell, ClusteringComparator, DecoratedKey, RangeTombstone, Row, RowData};
use crate::store::SecondaryIndexes;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Slab allocator
// ------------------------------------------------------------------------------------------------

/// Size of one allocation region.
pub const REGION_SIZE: u64 = 1024 * 1024;

/// Region-granular allocation accounting for one memtable.
///
/// Every key and cell stored in the memtable is copied through this
/// allocator. Regions are only ever acquired, never returned — the whole
/// footprint is released when the memtable is dropped — so the region
/// total is a hard lower bound on the memtable's live size.
#[derive(Debug, Default)]
pub struct SlabAllocator {
    allocated: AtomicU64,
}

impl SlabAllocator {
    /// Creates an allocator with no regions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes`, accounting the allocation.
    pub fn clone_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        self.allocated.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        bytes.to_vec()
    }

    /// Copies a cell, cloning name and value through the allocator.
    pub fn clone_cell(&self, cell: &Cell) -> Cell {
        match cell {
            Cell::Live {
                name,
                value,
                timestamp,
            } => Cell::Live {
                name: self.clone_bytes(name),
                value: self.clone_bytes(value),
                timestamp: *timestamp,
            },
            Cell::Expiring {
                name,
                value,
                timestamp,
                ttl,
                local_deletion_time,
            } => Cell::Expiring {
                name: self.clone_bytes(name),
                value: self.clone_bytes(value),
                timestamp: *timestamp,
                ttl: *ttl,
                local_deletion_time: *local_deletion_time,
            },
            Cell::Deleted {
                name,
                timestamp,
                local_deletion_time,
            } => Cell::Deleted {
                name: self.clone_bytes(name),
                timestamp: *timestamp,
                local_deletion_time: *local_deletion_time,
            },
            Cell::Counter {
                name,
                shards,
                timestamp,
            } => Cell::Counter {
                name: self.clone_bytes(name),
                shards: shards.clone(),
                timestamp: *timestamp,
            },
        }
    }

    /// Total bytes routed through the allocator.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Footprint in whole regions — the floor for live-size estimates.
    pub fn minimum_size(&self) -> u64 {
        let allocated = self.allocated();
        if allocated == 0 {
            0
        } else {
            allocated.div_ceil(REGION_SIZE) * REGION_SIZE
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

// rough per-entry overhead of a skip-map node, counted by deep metering
const NODE_OVERHEAD: u64 = 96;

/// The concurrent in-memory write buffer.
pub struct Memtable {
    map: SkipMap<DecoratedKey, RwLock<RowData>>,
    allocator: SlabAllocator,
    comparator: ClusteringComparator,
    current_size: AtomicI64,
    operations: AtomicU64,
    key_bytes: AtomicU64,
    creation_time_secs: u64,
}

impl Memtable {
    /// Creates an empty memtable for a store using `comparator`.
    pub fn new(comparator: ClusteringComparator) -> Self {
        Self {
            map: SkipMap::new(),
            allocator: SlabAllocator::new(),
            comparator,
            current_size: AtomicI64::new(0),
            operations: AtomicU64::new(0),
            key_bytes: AtomicU64::new(0),
            creation_time_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// Merges `update` into the row for `key`.
    ///
    /// First touch of a key inserts an empty row with an allocator-cloned
    /// key via compare-and-set; losing the race merges into the winner.
    /// Every incoming cell is deep-copied through the slab allocator, and
    /// the secondary-index updater observes inserts and replacements.
    ///
    /// Only the owning store may call this, and only while holding its
    /// switch lock for read.
    pub fn put(
        &self,
        key: &DecoratedKey,
        update: &RowData,
        indexer: &dyn SecondaryIndexes,
    ) -> Result<(), MemtableError> {
        let entry = match self.map.get(key) {
            Some(entry) => entry,
            None => {
                let cloned = DecoratedKey {
                    token: key.token,
                    key: self.allocator.clone_bytes(&key.key),
                };
                self.key_bytes.fetch_add(key.key.len() as u64, Ordering::Relaxed);
                self.map.get_or_insert(cloned, RwLock::new(RowData::empty()))
            }
        };

        let mut row = entry
            .value()
            .write()
            .map_err(|_| MemtableError::Internal("row lock poisoned".into()))?;

        let mut size_delta: i64 = 0;

        if !update.deletion.is_live() {
            if update.deletion.top.marked_for_delete_at > row.deletion.top.marked_for_delete_at {
                row.deletion.top = update.deletion.top;
            }
            for rt in &update.deletion.ranges {
                let copied = RangeTombstone {
                    start: self.allocator.clone_bytes(&rt.start),
                    end: self.allocator.clone_bytes(&rt.end),
                    timestamp: rt.timestamp,
                    local_deletion_time: rt.local_deletion_time,
                };
                size_delta += copied.serialized_size() as i64;
                row.deletion.add_range(&self.comparator, copied);
            }
        }

        for cell in update.cells() {
            let copied = self.allocator.clone_cell(cell);
            let outcome = row.add_cell(&self.comparator, copied);
            size_delta += outcome.size_delta;
            match outcome.replaced {
                Some(old) => {
                    if let Some(winner) = row.get(&self.comparator, cell.name()) {
                        indexer.update(key, &old, winner);
                    }
                }
                None => {
                    if outcome.size_delta > 0 {
                        indexer.insert(key, cell);
                    }
                }
            }
        }
        drop(row);

        self.current_size.fetch_add(size_delta, Ordering::Relaxed);
        let ops = update.cell_count() as u64
            + u64::from(!update.deletion.top.is_live())
            + update.deletion.range_count() as u64;
        self.operations.fetch_add(ops, Ordering::Relaxed);

        trace!(
            key_len = key.key.len(),
            size_delta,
            ops,
            "memtable put applied"
        );
        Ok(())
    }

    /// The row stored for `key`, if any (cloned under the row lock).
    pub fn get_row(&self, key: &DecoratedKey) -> Result<Option<RowData>, MemtableError> {
        match self.map.get(key) {
            None => Ok(None),
            Some(entry) => {
                let row = entry
                    .value()
                    .read()
                    .map_err(|_| MemtableError::Internal("row lock poisoned".into()))?;
                Ok(Some(row.clone()))
            }
        }
    }

    /// Rows between the inclusive bounds, in partition order, read from a
    /// live snapshot of the map.
    pub fn range_rows(
        &self,
        start: Option<&DecoratedKey>,
        end: Option<&DecoratedKey>,
    ) -> Vec<Row> {
        let mut rows = Vec::new();
        for entry in self.map.iter() {
            if let Some(start) = start {
                if entry.key() < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if entry.key() > end {
                    break;
                }
            }
            if let Ok(row) = entry.value().read() {
                rows.push(Row {
                    key: entry.key().clone(),
                    data: row.clone(),
                });
            }
        }
        rows
    }

    /// All rows in partition order — the stable view a flush writes out.
    pub fn sorted_rows(&self) -> Vec<Row> {
        self.range_rows(None, None)
    }

    /// True if nothing has been written.
    pub fn is_clean(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of distinct partitions.
    pub fn partition_count(&self) -> usize {
        self.map.len()
    }

    /// Serialized-byte estimate of the contents.
    pub fn serialized_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed).max(0) as u64
    }

    /// Number of operations applied (cells + tombstone markers).
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Creation time, seconds since the epoch.
    pub fn creation_time_secs(&self) -> u64 {
        self.creation_time_secs
    }

    /// The slab allocator backing this memtable.
    pub fn allocator(&self) -> &SlabAllocator {
        &self.allocator
    }

    /// Live-size estimate: `serialized_size * live_ratio`, floored by the
    /// allocator's region footprint.
    pub fn live_size(&self, live_ratio: f64) -> u64 {
        let estimated = (self.serialized_size() as f64 * live_ratio) as u64;
        estimated.max(self.allocator.minimum_size())
    }

    /// Expected on-disk size of a flush: keys appear in both the index
    /// and the data file, plus a 20% allowance for the filter and row
    /// index components.
    pub fn flush_estimated_size(&self) -> u64 {
        let keys = self.key_bytes.load(Ordering::Relaxed);
        ((keys * 2 + self.serialized_size()) as f64 * 1.2) as u64
    }

    /// Deep heap footprint, walked entry by entry by the metering task.
    pub fn deep_size(&self) -> u64 {
        let mut size = 0u64;
        for entry in self.map.iter() {
            size += NODE_OVERHEAD + entry.key().key.len() as u64;
            if let Ok(row) = entry.value().read() {
                size += row.heap_size();
            }
        }
        size
    }

    /// The clustering comparator this memtable sorts cells with.
    pub fn comparator(&self) -> ClusteringComparator {
        self.comparator
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("partitions", &self.map.len())
            .field("serialized_size", &self.serialized_size())
            .field("operations", &self.operations())
            .finish()
    }
}
