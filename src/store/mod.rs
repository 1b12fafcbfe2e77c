//! # Column-family store
//!
//! The owning facade over one table's storage: the write path into the
//! active memtable, the collating read path, memtable switching and
//! flush submission, compaction driving, and recovery of the on-disk
//! component sets at startup.
//!
//! ## Locking
//!
//! Writers hold the switch lock for read while applying a mutation;
//! [`ColumnFamilyStore::switch_memtable`] holds it for write while it
//! swaps in a fresh memtable and registers the flush's replay position —
//! which is why flush registrations happen in commit-log order.
//!
//! ## Global state
//!
//! There is none: the process-wide pieces (executors, caches, the
//! commit-log signaller) live in a [`SystemContext`] constructed at
//! startup and passed to every store explicitly.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::leveled::{CompactionCandidate, LeveledManifest, LeveledScanner};
use crate::compaction::{CompactionController, CompactionError};
use crate::executor::{ExecutorError, FlushSignal, PostFlushSignaller, TaskHandle, ThreadPool};
use crate::memtable::{Memtable, MemtableError};
use crate::row::{
    Cell, ClusteringComparator, DecoratedKey, PartitionerRef, QueryFilter, Row, RowData, Token,
};
use crate::sstable::{
    Component, Descriptor, MetadataCollector, RowView, SSTableError, SSTableReader, SSTableScanner,
    SSTableWriter,
};
use crate::stats::ReplayPosition;
use crate::tracker::{DataTracker, KeyCache, RowCache};

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Memtable failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Sorted-table failure.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Compaction failure.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Executor failure.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fatal flush failure halted new writes.
    #[error("writes halted after unrecoverable flush failure")]
    WritesHalted,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// External collaborator traits
// ------------------------------------------------------------------------------------------------

/// The commit log this engine records positions against. Durability and
/// replay live elsewhere; the store only reads the current position at
/// each memtable switch and signals flushed positions back in order.
pub trait CommitLog: Send + Sync {
    /// The position a flush started now would cover.
    fn current_position(&self) -> ReplayPosition;

    /// Called in monotone position order once everything below
    /// `position` is persisted in sorted tables.
    fn on_flush(&self, position: ReplayPosition);
}

/// A commit log that hands out positions from a counter and ignores
/// flush signals. Used when no commit log is wired in.
#[derive(Default)]
pub struct NoopCommitLog {
    counter: AtomicU64,
}

impl CommitLog for NoopCommitLog {
    fn current_position(&self) -> ReplayPosition {
        ReplayPosition {
            segment: 0,
            position: self.counter.fetch_add(1, Ordering::Relaxed) as u32,
        }
    }

    fn on_flush(&self, _position: ReplayPosition) {}
}

/// Secondary-index maintenance hooks observed by the write path and the
/// compaction reducer. Index *queries* are out of scope.
pub trait SecondaryIndexes: Send + Sync {
    /// True if any index is configured; gates the per-cell work.
    fn has_indexes(&self) -> bool {
        false
    }

    /// A cell was written for the first time.
    fn insert(&self, _key: &DecoratedKey, _cell: &Cell) {}

    /// A stored cell was replaced by a newer one.
    fn update(&self, _key: &DecoratedKey, _old: &Cell, _new: &Cell) {}

    /// A stored cell was superseded by a newer cell with a different
    /// value during reduction.
    fn remove(&self, _key: &DecoratedKey, _cell: &Cell) {}
}

/// The no-index default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndexes;

impl SecondaryIndexes for NullIndexes {}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Per-store tuning knobs.
pub struct StoreConfig {
    /// Memtable live-size threshold that triggers a switch.
    pub memtable_throughput: u64,
    /// Promoted row-index block size.
    pub column_index_size: u64,
    /// Merged rows above this size compact incrementally.
    pub in_memory_compaction_limit: u64,
    /// Maximum size of one compaction output table; also sets the level
    /// size base.
    pub max_sstable_size: u64,
    /// Bloom-filter false-positive target.
    pub bloom_fp_chance: f64,
    /// Tombstones younger than this many seconds are never purged.
    pub gc_grace_seconds: i64,
    /// Index sampling interval for the summary component.
    pub summary_interval: u32,
    /// Writes between live-ratio metering submissions.
    pub meter_interval: u64,
    /// Batchlog semantics: tombstoned-and-empty rows are not flushed.
    pub batchlog: bool,
    /// Commutative (counter) semantics: purging compactions merge and
    /// drop old shards.
    pub commutative: bool,
    /// Data directories, tried in order when one fails.
    pub data_dirs: Vec<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable_throughput: 32 * 1024 * 1024,
            column_index_size: 64 * 1024,
            in_memory_compaction_limit: 64 * 1024 * 1024,
            max_sstable_size: 160 * 1024 * 1024,
            bloom_fp_chance: 0.01,
            gc_grace_seconds: 864_000,
            summary_interval: 128,
            meter_interval: 10_000,
            batchlog: false,
            commutative: false,
            data_dirs: Vec::new(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// System context
// ------------------------------------------------------------------------------------------------

/// Process-wide services shared by every store: the bounded flush and
/// compaction pools, the singleton metering pool, the caches, and the
/// commit-log signal stage.
pub struct SystemContext {
    pub flush_pool: ThreadPool,
    pub compaction_pool: ThreadPool,
    pub metering_pool: ThreadPool,
    pub signaller: PostFlushSignaller,
    pub key_cache: Arc<KeyCache>,
    pub row_cache: Arc<RowCache>,
    commit_log: Arc<dyn CommitLog>,
}

impl SystemContext {
    /// Builds the context with the given pool sizes.
    pub fn new(
        flush_writers: usize,
        flush_queue_size: usize,
        compaction_concurrency: usize,
        commit_log: Arc<dyn CommitLog>,
    ) -> Arc<SystemContext> {
        Arc::new(SystemContext {
            flush_pool: ThreadPool::new("flush-writer", flush_writers, flush_queue_size),
            compaction_pool: ThreadPool::new("compaction", compaction_concurrency, 64),
            metering_pool: ThreadPool::new("memory-meter", 1, 64),
            signaller: PostFlushSignaller::new(Arc::clone(&commit_log)),
            key_cache: Arc::new(KeyCache::new()),
            row_cache: Arc::new(RowCache::new()),
            commit_log,
        })
    }

    /// A context with one of everything and a no-op commit log.
    pub fn for_tests() -> Arc<SystemContext> {
        Self::new(1, 4, 1, Arc::new(NoopCommitLog::default()))
    }
}

// ------------------------------------------------------------------------------------------------
// Column-family store
// ------------------------------------------------------------------------------------------------

const MIN_LIVE_RATIO: f64 = 1.0;
const MAX_LIVE_RATIO: f64 = 64.0;

/// One table's storage engine.
pub struct ColumnFamilyStore {
    pub keyspace: String,
    pub name: String,
    config: StoreConfig,
    partitioner: PartitionerRef,
    comparator: ClusteringComparator,
    tracker: DataTracker,
    manifest: Mutex<LeveledManifest>,
    context: Arc<SystemContext>,
    indexes: Arc<dyn SecondaryIndexes>,
    next_generation: AtomicU64,
    switch_lock: RwLock<()>,
    live_ratio: Mutex<f64>,
    metering_pending: AtomicBool,
    writes_halted: AtomicBool,
    failed_dirs: Mutex<HashSet<PathBuf>>,
    compactions_cancelled: AtomicBool,
    // handle background tasks use to re-reach the store
    self_ref: Weak<ColumnFamilyStore>,
}

impl ColumnFamilyStore {
    /// Opens (or creates) the store, recovering complete component sets
    /// from the data directories and sweeping incomplete leftovers.
    pub fn open(
        keyspace: impl Into<String>,
        name: impl Into<String>,
        config: StoreConfig,
        partitioner: PartitionerRef,
        comparator: ClusteringComparator,
        context: Arc<SystemContext>,
        indexes: Arc<dyn SecondaryIndexes>,
    ) -> Result<Arc<ColumnFamilyStore>, StoreError> {
        let keyspace = keyspace.into();
        let name = name.into();
        if config.data_dirs.is_empty() {
            return Err(StoreError::Internal("no data directories configured".into()));
        }
        for dir in &config.data_dirs {
            fs::create_dir_all(dir)?;
        }

        let manifest_path = config.data_dirs[0].join(format!("{name}-manifest.db"));
        let level_map = LeveledManifest::read_snapshot(&manifest_path)?;
        let mut manifest = LeveledManifest::new(manifest_path, config.max_sstable_size);

        let (readers, max_generation) =
            Self::recover_sstables(&config, &keyspace, &name, &partitioner, comparator, &context)?;
        for reader in &readers {
            let level = level_map.get(&reader.generation()).copied().unwrap_or(0);
            manifest.add_recovered(Arc::clone(reader), level)?;
        }

        let memtable = Arc::new(Memtable::new(comparator));
        let tracker = DataTracker::new(memtable);
        tracker.add_sstables(readers);

        info!(
            keyspace = %keyspace,
            name = %name,
            recovered = tracker.view().sstables.len(),
            next_generation = max_generation + 1,
            "opened column family store"
        );

        Ok(Arc::new_cyclic(|self_ref| ColumnFamilyStore {
            keyspace,
            name,
            config,
            partitioner,
            comparator,
            tracker,
            manifest: Mutex::new(manifest),
            context,
            indexes,
            next_generation: AtomicU64::new(max_generation + 1),
            switch_lock: RwLock::new(()),
            live_ratio: Mutex::new(MIN_LIVE_RATIO),
            metering_pending: AtomicBool::new(false),
            writes_halted: AtomicBool::new(false),
            failed_dirs: Mutex::new(HashSet::new()),
            compactions_cancelled: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// The owning `Arc`, for handing to background tasks.
    fn strong_self(&self) -> Result<Arc<ColumnFamilyStore>, StoreError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| StoreError::Internal("store already dropped".into()))
    }

    fn recover_sstables(
        config: &StoreConfig,
        keyspace: &str,
        name: &str,
        partitioner: &PartitionerRef,
        comparator: ClusteringComparator,
        context: &Arc<SystemContext>,
    ) -> Result<(Vec<Arc<SSTableReader>>, u64), StoreError> {
        let mut readers = Vec::new();
        let mut max_generation = 0u64;
        for dir in &config.data_dirs {
            let mut seen: HashSet<u64> = HashSet::new();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let filename = entry.file_name();
                let Some(filename) = filename.to_str() else {
                    continue;
                };
                let Some((descriptor, _)) = Descriptor::parse_filename(dir, keyspace, filename)
                else {
                    continue;
                };
                if descriptor.cf != name || !seen.insert(descriptor.generation) {
                    continue;
                }
                max_generation = max_generation.max(descriptor.generation);
                match crate::sstable::verify_component_set(&descriptor) {
                    Ok(()) => {
                        match SSTableReader::open(
                            descriptor.clone(),
                            Arc::clone(partitioner),
                            comparator,
                            Some(Arc::clone(&context.key_cache)),
                        ) {
                            Ok(reader) => readers.push(Arc::new(reader)),
                            Err(e) => {
                                warn!(descriptor = %descriptor, %e, "skipping unreadable sstable");
                            }
                        }
                    }
                    Err(_) => {
                        // leftovers of an aborted writer; sweep them
                        warn!(descriptor = %descriptor, "removing incomplete sstable set");
                        for component in Component::ALL {
                            let _ = fs::remove_file(descriptor.path_for(component));
                        }
                    }
                }
            }
        }
        Ok((readers, max_generation))
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// The tracker owning the live set.
    pub fn tracker(&self) -> &DataTracker {
        &self.tracker
    }

    /// The shared key cache.
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.context.key_cache
    }

    /// The shared row cache.
    pub fn row_cache(&self) -> &Arc<RowCache> {
        &self.context.row_cache
    }

    /// Table count in a manifest level.
    pub fn level_count(&self, level: usize) -> usize {
        self.lock_manifest().level_count(level)
    }

    /// Tables of a manifest level.
    pub fn level_sstables(&self, level: usize) -> Vec<Arc<SSTableReader>> {
        self.lock_manifest().level(level).to_vec()
    }

    /// Decorates raw key bytes with this store's partitioner.
    pub fn decorate(&self, key: &[u8]) -> DecoratedKey {
        self.partitioner.decorate(key.to_vec())
    }

    /// The clustering comparator of this store.
    pub fn comparator(&self) -> ClusteringComparator {
        self.comparator
    }

    /// Creation time (seconds) of the oldest unflushed memtable.
    pub fn oldest_unflushed_memtable_secs(&self) -> u64 {
        self.tracker.oldest_unflushed_memtable_secs()
    }

    fn lock_manifest(&self) -> std::sync::MutexGuard<'_, LeveledManifest> {
        match self.manifest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn gc_before(&self) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        (now - self.config.gc_grace_seconds).clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Applies one mutation to the active memtable.
    pub fn apply(&self, key: &DecoratedKey, update: &RowData) -> Result<(), StoreError> {
        if self.writes_halted.load(Ordering::Acquire) {
            return Err(StoreError::WritesHalted);
        }
        {
            let _guard = match self.switch_lock.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let view = self.tracker.view();
            view.memtable.put(key, update, self.indexes.as_ref())?;
            self.context.row_cache.invalidate(&key.key);

            if view.memtable.operations() % self.config.meter_interval.max(1) == 0 {
                self.submit_metering();
            }
        }

        let live_ratio = self.current_live_ratio();
        let view = self.tracker.view();
        if view.memtable.live_size(live_ratio) > self.config.memtable_throughput {
            debug!(
                live_size = view.memtable.live_size(live_ratio),
                threshold = self.config.memtable_throughput,
                "memtable over threshold, switching"
            );
            self.switch_memtable()?;
        }
        Ok(())
    }

    fn current_live_ratio(&self) -> f64 {
        match self.live_ratio.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Asks the metering pool to recalibrate the live ratio. At most one
    /// metering is pending per store; later submissions are dropped.
    pub fn submit_metering(&self) {
        if self.metering_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(store) = self.strong_self() else {
            self.metering_pending.store(false, Ordering::Release);
            return;
        };
        let submitted = self.context.metering_pool.submit(move || {
            // meter whichever memtable is active by the time we run
            let memtable = store.tracker.view().memtable.clone();
            let serialized = memtable.serialized_size();
            if serialized > 0 {
                let deep = memtable.deep_size();
                let mut ratio = deep as f64 / serialized as f64;
                ratio = ratio.clamp(MIN_LIVE_RATIO, MAX_LIVE_RATIO);
                let mut live = match store.live_ratio.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // higher estimates are believed immediately, lower ones
                // averaged with the old value
                if ratio > *live {
                    *live = ratio;
                } else {
                    *live = (*live + ratio) / 2.0;
                }
                info!(
                    store = %store.name,
                    live_ratio = *live,
                    measured = ratio,
                    "recalibrated memtable live ratio"
                );
            }
            store.metering_pending.store(false, Ordering::Release);
        });
        if submitted.is_err() {
            self.metering_pending.store(false, Ordering::Release);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Switches the active memtable out and submits its flush. Returns
    /// the flush signal, or `None` when the memtable was clean.
    pub fn switch_memtable(&self) -> Result<Option<Arc<FlushSignal>>, StoreError> {
        let (switched, position, signal) = {
            let _guard = match self.switch_lock.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.tracker.view().memtable.is_clean() {
                return Ok(None);
            }
            let fresh = Arc::new(Memtable::new(self.comparator));
            let switched = self.tracker.switch_memtable(fresh);
            let position = self.context.commit_log.current_position();
            let signal = self.context.signaller.register(position);
            (switched, position, signal)
        };

        let store = self.strong_self()?;
        let task_memtable = Arc::clone(&switched);
        let task_signal = Arc::clone(&signal);
        self.context.flush_pool.submit(move || {
            store.flush_task(task_memtable, position, task_signal);
        })?;
        Ok(Some(signal))
    }

    /// Switches and waits for the flush (and any follow-up compaction
    /// submission) to complete.
    pub fn force_blocking_flush(&self) -> Result<(), StoreError> {
        let Some(signal) = self.switch_memtable()? else {
            return Ok(());
        };
        // wait for the tracker swap rather than the commit-log signal:
        // the signal may be held back by an earlier store's flush
        while !signal.is_done() {
            if self.writes_halted.load(Ordering::Acquire) {
                return Err(StoreError::WritesHalted);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(())
    }

    fn flush_task(
        &self,
        memtable: Arc<Memtable>,
        position: ReplayPosition,
        signal: Arc<FlushSignal>,
    ) {
        match self.write_flush(&memtable, position) {
            Ok(reader) => {
                if let Some(reader) = &reader {
                    if let Err(e) = self.lock_manifest().add_flushed(Arc::clone(reader)) {
                        error!(store = %self.name, %e, "failed to persist level snapshot");
                    }
                }
                self.tracker.replace_flushed(&memtable, reader);
                self.context.signaller.complete(&signal);
                self.maybe_submit_compaction();
            }
            Err(e) => {
                // memtable stays in flushing state; new writes halt
                error!(store = %self.name, %e, "flush failed on every data directory");
                self.writes_halted.store(true, Ordering::Release);
            }
        }
    }

    /// Writes one memtable to a new table, retrying other data
    /// directories when a disk fails.
    fn write_flush(
        &self,
        memtable: &Arc<Memtable>,
        position: ReplayPosition,
    ) -> Result<Option<Arc<SSTableReader>>, StoreError> {
        let estimated = memtable.flush_estimated_size();
        loop {
            let Some(dir) = self.writeable_location() else {
                return Err(StoreError::Internal(
                    "no writeable data directory remains".into(),
                ));
            };
            match self.write_flush_to(memtable, position, &dir) {
                Ok(reader) => return Ok(reader),
                Err(e) => {
                    warn!(
                        store = %self.name,
                        dir = %dir.display(),
                        estimated,
                        %e,
                        "flush failed, excluding directory and retrying"
                    );
                    if let Ok(mut failed) = self.failed_dirs.lock() {
                        failed.insert(dir);
                    }
                }
            }
        }
    }

    /// The first data directory not excluded by an earlier write error.
    fn writeable_location(&self) -> Option<PathBuf> {
        let failed = match self.failed_dirs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.config
            .data_dirs
            .iter()
            .find(|dir| !failed.contains(*dir))
            .cloned()
    }

    fn write_flush_to(
        &self,
        memtable: &Arc<Memtable>,
        position: ReplayPosition,
        dir: &PathBuf,
    ) -> Result<Option<Arc<SSTableReader>>, StoreError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let descriptor = Descriptor::new(dir.clone(), &self.keyspace, &self.name, generation);
        let collector = MetadataCollector::new().replay_position(position);
        let mut writer = SSTableWriter::create(
            descriptor,
            memtable.partition_count(),
            self.config.bloom_fp_chance,
            self.comparator,
            Arc::clone(&self.partitioner),
            collector,
            self.config.column_index_size,
            self.config.summary_interval,
        )?;

        for row in memtable.sorted_rows() {
            let mut data = row.data;
            if !data.deletion.top.is_live() {
                // drop cells shadowed by the row tombstone, but never the
                // tombstone itself; stale cells must stay visible to the
                // index cleanup path when indexes exist
                if !self.indexes.has_indexes() {
                    data.remove_deleted(&self.comparator, i32::MIN);
                }
                if self.config.batchlog && data.is_empty() {
                    continue;
                }
            }
            writer.append(&row.key, &data)?;
        }

        if writer.rows_written() == 0 {
            info!(store = %self.name, "flush produced no rows, aborting writer");
            writer.abort();
            return Ok(None);
        }
        let reader = writer.close_and_open_reader(Some(Arc::clone(&self.context.key_cache)))?;
        info!(
            store = %self.name,
            descriptor = %reader.descriptor,
            bytes = reader.data_size(),
            "flush complete"
        );
        Ok(Some(reader))
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Collates a partition across the active memtable, flushing
    /// memtables and every live table, reconciles, and strips data
    /// deleted before the grace period. `None` means no source held the
    /// partition.
    pub fn get_row(&self, key: &DecoratedKey, filter: &QueryFilter) -> Result<Option<Row>, StoreError> {
        let view = self.tracker.view();
        let mut merged = RowData::empty();
        let mut found = false;

        if let Some(cached) = self.context.row_cache.get(&key.key) {
            let mut data = (*cached).clone();
            data.remove_deleted(&self.comparator, self.gc_before());
            return Ok(Some(Row {
                key: key.clone(),
                data: self.filtered(data, filter),
            }));
        }

        if let Some(row) = view.memtable.get_row(key)? {
            merged.delete(&self.comparator, &row.deletion);
            for cell in row.cells() {
                merged.add_cell(&self.comparator, cell.clone());
            }
            found = true;
        }
        for flushing in &view.flushing {
            if let Some(row) = flushing.get_row(key)? {
                merged.delete(&self.comparator, &row.deletion);
                for cell in row.cells() {
                    merged.add_cell(&self.comparator, cell.clone());
                }
                found = true;
            }
        }

        let full = matches!(filter, QueryFilter::Slice { start, end, .. }
            if start.is_empty() && end.is_empty());
        let read_filter = if full { QueryFilter::all() } else { filter.clone() };
        for reader in view.containing(key.token) {
            match reader.read_row(key, &read_filter) {
                Ok(Some(fragment)) => {
                    let mut deletion = crate::row::DeletionInfo::live();
                    deletion.top = fragment.deletion;
                    for rt in fragment.ranges {
                        deletion.add_range(&self.comparator, rt);
                    }
                    merged.delete(&self.comparator, &deletion);
                    for cell in fragment.cells {
                        merged.add_cell(&self.comparator, cell);
                    }
                    found = true;
                }
                Ok(None) => {}
                Err(e @ SSTableError::Corrupt { .. }) => {
                    reader.mark_suspect();
                    self.tracker.drop_suspect(reader.generation());
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !found {
            return Ok(None);
        }
        if full {
            self.context
                .row_cache
                .insert(key.key.clone(), Arc::new(merged.clone()));
        }
        merged.remove_deleted(&self.comparator, self.gc_before());
        Ok(Some(Row {
            key: key.clone(),
            data: self.filtered(merged, filter),
        }))
    }

    fn filtered(&self, data: RowData, filter: &QueryFilter) -> RowData {
        match filter {
            QueryFilter::Slice { start, end, .. } if start.is_empty() && end.is_empty() => data,
            _ => {
                let deletion = data.deletion.clone();
                let cells: Vec<Cell> = data
                    .cells()
                    .iter()
                    .filter(|cell| filter.selects(&self.comparator, cell))
                    .cloned()
                    .collect();
                RowData::from_parts(&self.comparator, deletion, cells)
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Cancels running and future compactions (drain / shutdown path).
    pub fn cancel_compactions(&self) {
        self.compactions_cancelled.store(true, Ordering::Release);
    }

    /// Submits one background compaction round if any level is over
    /// target.
    fn maybe_submit_compaction(&self) {
        let Ok(store) = self.strong_self() else {
            return;
        };
        let _ = self.context.compaction_pool.submit(move || {
            if let Err(e) = store.compact_one_round(false) {
                warn!(store = %store.name, %e, "background compaction failed");
            }
        });
    }

    /// Runs leveled compaction rounds until every level is within
    /// target, draining L0 first regardless of score. Each round runs on
    /// the compaction pool.
    pub fn force_major_compaction(&self) -> Result<(), StoreError> {
        loop {
            let store = self.strong_self()?;
            let handle: TaskHandle<Result<bool, StoreError>> = self
                .context
                .compaction_pool
                .submit_with_result(move || store.compact_one_round(true))?;
            if !handle.wait()?? {
                return Ok(());
            }
        }
    }

    /// Compacts an explicit set of live tables (user-defined
    /// compaction). Outputs land in `target_level`.
    pub fn compact_sstables(
        &self,
        generations: &[u64],
        target_level: usize,
    ) -> Result<bool, StoreError> {
        let view = self.tracker.view();
        let mut sstables = Vec::new();
        for generation in generations {
            match view.sstable(*generation) {
                Some(reader) => sstables.push(Arc::clone(reader)),
                None => return Ok(false),
            }
        }
        let candidate = CompactionCandidate {
            level: 0,
            target_level,
            sstables,
        };
        self.run_compaction(candidate)
    }

    fn compact_one_round(&self, forced: bool) -> Result<bool, StoreError> {
        if self.compactions_cancelled.load(Ordering::Acquire) {
            return Ok(false);
        }
        let candidate = {
            let compacting = self.tracker.view().compacting.clone();
            let manifest = self.lock_manifest();
            match manifest.compaction_candidates(&compacting) {
                Some(candidate) => Some(candidate),
                None if forced => manifest.forced_l0_candidates(&compacting),
                None => None,
            }
        };
        let Some(candidate) = candidate else {
            return Ok(false);
        };
        self.run_compaction(candidate)
    }

    fn run_compaction(&self, candidate: CompactionCandidate) -> Result<bool, StoreError> {
        let generations = candidate.generations();
        if !self.tracker.mark_compacting(&generations) {
            return Ok(false);
        }
        info!(
            store = %self.name,
            level = candidate.level,
            target = candidate.target_level,
            inputs = ?generations,
            "compaction starting"
        );
        match self.compact_inputs(&candidate) {
            Ok(outputs) => {
                for input in &candidate.sstables {
                    input.mark_compacted();
                }
                self.lock_manifest()
                    .replace(&candidate.sstables, &outputs, candidate.target_level)?;
                self.tracker
                    .replace_compacted(&candidate.sstables, outputs);
                Ok(true)
            }
            Err(e) => {
                // outputs aborted, inputs untouched: retry is always safe
                self.tracker.unmark_compacting(&generations);
                Err(e)
            }
        }
    }

    fn compact_inputs(
        &self,
        candidate: &CompactionCandidate,
    ) -> Result<Vec<Arc<SSTableReader>>, StoreError> {
        let view = self.tracker.view();
        let controller = CompactionController::new(
            &view,
            &candidate.sstables,
            self.gc_before(),
            self.oldest_unflushed_memtable_secs(),
            self.comparator,
            Some(Arc::clone(&self.context.row_cache)),
            self.config.in_memory_compaction_limit,
            self.config.commutative,
        );

        // keys cached for any input get re-cached for the outputs
        let mut preheat: HashSet<Vec<u8>> = HashSet::new();
        for generation in candidate.generations() {
            preheat.extend(self.context.key_cache.keys_for_generation(generation));
        }

        let estimated_rows: u64 = candidate
            .sstables
            .iter()
            .map(|r| r.metadata.estimated_row_size.count())
            .sum();

        let mut rows = CompactionRowIterator::new(
            candidate
                .sstables
                .iter()
                .map(SSTableReader::scanner)
                .collect(),
        )?;

        let mut outputs: Vec<Arc<SSTableReader>> = Vec::new();
        let mut writer: Option<SSTableWriter> = None;
        let result = (|| -> Result<(), StoreError> {
            while let Some(fragments) = rows.next_group()? {
                if self.compactions_cancelled.load(Ordering::Acquire) {
                    return Err(CompactionError::Cancelled.into());
                }
                let Some(compacted) =
                    controller.compacted_row(fragments, self.indexes.as_ref())?
                else {
                    continue;
                };
                if writer
                    .as_ref()
                    .is_some_and(|w| w.data_size() >= self.config.max_sstable_size)
                {
                    if let Some(finished) = writer.take() {
                        outputs.push(
                            finished
                                .close_and_open_reader(Some(Arc::clone(&self.context.key_cache)))?,
                        );
                    }
                }
                if writer.is_none() {
                    writer = Some(self.new_compaction_writer(candidate, estimated_rows)?);
                }
                let active = writer
                    .as_mut()
                    .ok_or_else(|| StoreError::Internal("compaction writer missing".into()))?;
                let entry = compacted.write(active)?;
                if let Some(entry) = entry {
                    let key = compacted.key();
                    if preheat.contains(&key.key) {
                        self.context.key_cache.insert(
                            active.descriptor().generation,
                            key.key.clone(),
                            entry,
                        );
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                if let Some(last) = writer.take() {
                    if last.rows_written() > 0 {
                        outputs
                            .push(last.close_and_open_reader(Some(Arc::clone(&self.context.key_cache)))?);
                    } else {
                        last.abort();
                    }
                }
                controller.close();
                info!(
                    store = %self.name,
                    outputs = outputs.len(),
                    "compaction wrote outputs"
                );
                Ok(outputs)
            }
            Err(e) => {
                // abort current and finished outputs; the inputs stay live
                if let Some(w) = writer.take() {
                    w.abort();
                }
                for output in outputs {
                    output.mark_compacted();
                }
                controller.close();
                Err(e)
            }
        }
    }

    fn new_compaction_writer(
        &self,
        candidate: &CompactionCandidate,
        estimated_rows: u64,
    ) -> Result<SSTableWriter, StoreError> {
        let Some(dir) = self.writeable_location() else {
            return Err(StoreError::Internal(
                "no writeable data directory remains".into(),
            ));
        };
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let descriptor = Descriptor::new(dir, &self.keyspace, &self.name, generation);
        let mut collector = MetadataCollector::new().replay_position(ReplayPosition::NONE);
        for ancestor in candidate.generations() {
            collector.add_ancestor(ancestor);
        }
        Ok(SSTableWriter::create(
            descriptor,
            estimated_rows.clamp(1, u32::MAX as u64) as usize,
            self.config.bloom_fp_chance,
            self.comparator,
            Arc::clone(&self.partitioner),
            collector,
            self.config.column_index_size,
            self.config.summary_interval,
        )?)
    }

    // --------------------------------------------------------------------------------------------
    // Validation
    // --------------------------------------------------------------------------------------------

    /// Submits a validation scan over a token range: every live table's
    /// rows in the range are merged and digested into a tree root.
    pub fn submit_validation(
        &self,
        range: (Token, Token),
    ) -> Result<TaskHandle<Result<[u8; 32], StoreError>>, StoreError> {
        let store = self.strong_self()?;
        Ok(self
            .context
            .compaction_pool
            .submit_with_result(move || store.validate(range))?)
    }

    fn validate(&self, range: (Token, Token)) -> Result<[u8; 32], StoreError> {
        let view = self.tracker.view();
        let sstables = view.overlapping(range.0, range.1);
        let controller = CompactionController::without_overlaps(
            self.comparator,
            // validation must see tombstones; never purge
            i32::MIN,
            self.config.in_memory_compaction_limit,
        );
        let mut rows =
            CompactionRowIterator::new(sstables.iter().map(SSTableReader::scanner).collect())?;
        let mut tree = Sha256::new();
        while let Some(fragments) = rows.next_group()? {
            if self.compactions_cancelled.load(Ordering::Acquire) {
                return Err(CompactionError::Cancelled.into());
            }
            let Some(first) = fragments.first() else {
                continue;
            };
            let key = first.key.clone();
            if key.token < range.0 || key.token > range.1 {
                continue;
            }
            let Some(compacted) = controller.compacted_row(fragments, &NullIndexes)? else {
                continue;
            };
            tree.update(&key.key);
            compacted.update_digest(&mut tree)?;
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&tree.finalize());
        debug!(store = %self.name, "validation complete");
        Ok(root)
    }

    /// A positional scanner over one level's tables (repair,
    /// verification tooling).
    pub fn level_scanner(&self, level: usize) -> LeveledScanner {
        LeveledScanner::new(self.level_sstables(level))
    }

    /// Drops the store's live set; table files are deleted as their
    /// readers are released.
    pub fn invalidate(&self) {
        self.cancel_compactions();
        self.tracker
            .invalidate(Arc::new(Memtable::new(self.comparator)));
        info!(store = %self.name, "store invalidated");
    }
}

// ------------------------------------------------------------------------------------------------
// Row grouping across input scanners
// ------------------------------------------------------------------------------------------------

/// Aligns rows across k scanners: each `next_group` yields every input's
/// fragment of the smallest pending partition key.
struct CompactionRowIterator {
    scanners: Vec<SSTableScanner>,
    heads: Vec<Option<RowView>>,
}

impl CompactionRowIterator {
    fn new(mut scanners: Vec<SSTableScanner>) -> Result<Self, SSTableError> {
        let mut heads = Vec::with_capacity(scanners.len());
        for scanner in &mut scanners {
            heads.push(scanner.next_row()?);
        }
        Ok(Self { scanners, heads })
    }

    fn next_group(&mut self) -> Result<Option<Vec<RowView>>, SSTableError> {
        let mut min_key: Option<DecoratedKey> = None;
        for head in self.heads.iter().flatten() {
            match &min_key {
                None => min_key = Some(head.key.clone()),
                Some(current) if head.key < *current => min_key = Some(head.key.clone()),
                _ => {}
            }
        }
        let Some(min_key) = min_key else {
            return Ok(None);
        };

        let mut group = Vec::new();
        for i in 0..self.heads.len() {
            let matches = self.heads[i]
                .as_ref()
                .is_some_and(|head| head.key == min_key);
            if matches {
                if let Some(head) = self.heads[i].take() {
                    group.push(head);
                }
                self.heads[i] = self.scanners[i].next_row()?;
            }
        }
        Ok(Some(group))
    }
}
