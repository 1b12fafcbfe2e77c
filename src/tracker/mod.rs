//! # Data tracker
//!
//! Owns the live `(memtable, flushing memtables, sstables)` set for one
//! store as an atomically swappable snapshot. Every mutator builds a new
//! [`View`] and publishes it through a single reference; readers acquire
//! the snapshot once and keep it for the duration of their operation, so
//! swaps during a read are invisible to it.
//!
//! Reference counting on sorted tables is the `Arc` itself: a reader
//! marked compacted deletes its files (and evicts its key-cache entries)
//! when the last holder — view, iterator, or cache — lets go.


use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::memtable::Memtable;
use crate::row::{RowData, Token};
use crate::sstable::{RowIndexEntry, SSTableReader};

// ------------------------------------------------------------------------------------------------
// Caches
// ------------------------------------------------------------------------------------------------

/// Concurrent cache of index positions, keyed by `(generation, key)`.
///
/// Entries survive compaction: a key cached for an input table is
/// re-cached for the output while it is written, and the input's entries
/// are dropped only when its reader's last reference goes away.
#[derive(Default)]
pub struct KeyCache {
    map: DashMap<(u64, Vec<u8>), RowIndexEntry>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, generation: u64, key: &[u8]) -> Option<RowIndexEntry> {
        self.map
            .get(&(generation, key.to_vec()))
            .map(|entry| *entry.value())
    }

    pub fn insert(&self, generation: u64, key: Vec<u8>, entry: RowIndexEntry) {
        self.map.insert((generation, key), entry);
    }

    /// Drops every entry belonging to a generation. Called when a
    /// replaced reader is released.
    pub fn invalidate_generation(&self, generation: u64) {
        self.map.retain(|(gen, _), _| *gen != generation);
    }

    /// Keys currently cached for a generation; used to pre-heat the
    /// cache for compaction outputs.
    pub fn keys_for_generation(&self, generation: u64) -> Vec<Vec<u8>> {
        self.map
            .iter()
            .filter(|entry| entry.key().0 == generation)
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Concurrent cache of materialized rows, keyed by partition-key bytes.
/// Writers invalidate on update; compaction invalidates on row
/// materialization.
#[derive(Default)]
pub struct RowCache {
    map: DashMap<Vec<u8>, Arc<RowData>>,
}

impl RowCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<RowData>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, key: Vec<u8>, row: Arc<RowData>) {
        self.map.insert(key, row);
    }

    pub fn invalidate(&self, key: &[u8]) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Interval tree
// ------------------------------------------------------------------------------------------------

/// Centered interval tree over the token ranges of a set of tables,
/// answering "which tables could contain token t" in O(log n) plus
/// output size.
pub struct IntervalTree {
    root: Option<Box<IntervalNode>>,
}

struct IntervalNode {
    center: Token,
    // intervals crossing the center, sorted two ways for directional scans
    by_start: Vec<(Token, Token, Arc<SSTableReader>)>,
    by_end: Vec<(Token, Token, Arc<SSTableReader>)>,
    left: Option<Box<IntervalNode>>,
    right: Option<Box<IntervalNode>>,
}

impl IntervalTree {
    /// Builds a tree over the given tables' `(first, last)` token ranges.
    pub fn build(sstables: &[Arc<SSTableReader>]) -> Self {
        let intervals: Vec<(Token, Token, Arc<SSTableReader>)> = sstables
            .iter()
            .map(|reader| {
                let (first, last) = reader.token_range();
                (first, last, Arc::clone(reader))
            })
            .collect();
        Self {
            root: Self::build_node(intervals),
        }
    }

    fn build_node(
        intervals: Vec<(Token, Token, Arc<SSTableReader>)>,
    ) -> Option<Box<IntervalNode>> {
        if intervals.is_empty() {
            return None;
        }
        let mut endpoints: Vec<Token> = intervals
            .iter()
            .flat_map(|(start, end, _)| [*start, *end])
            .collect();
        endpoints.sort();
        let center = endpoints[endpoints.len() / 2];

        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut crossing = Vec::new();
        for interval in intervals {
            if interval.1 < center {
                left.push(interval);
            } else if interval.0 > center {
                right.push(interval);
            } else {
                crossing.push(interval);
            }
        }

        let mut by_start = crossing.clone();
        by_start.sort_by_key(|(start, _, _)| *start);
        let mut by_end = crossing;
        by_end.sort_by_key(|(_, end, _)| std::cmp::Reverse(*end));

        Some(Box::new(IntervalNode {
            center,
            by_start,
            by_end,
            left: Self::build_node(left),
            right: Self::build_node(right),
        }))
    }

    /// Tables whose range contains `token`.
    pub fn containing(&self, token: Token) -> Vec<Arc<SSTableReader>> {
        let mut out = Vec::new();
        Self::search_point(&self.root, token, &mut out);
        out
    }

    fn search_point(
        node: &Option<Box<IntervalNode>>,
        token: Token,
        out: &mut Vec<Arc<SSTableReader>>,
    ) {
        let Some(node) = node else { return };
        if token < node.center {
            for (start, end, reader) in &node.by_start {
                if *start > token {
                    break;
                }
                if *end >= token {
                    out.push(Arc::clone(reader));
                }
            }
            Self::search_point(&node.left, token, out);
        } else if token > node.center {
            for (start, end, reader) in &node.by_end {
                if *end < token {
                    break;
                }
                if *start <= token {
                    out.push(Arc::clone(reader));
                }
            }
            Self::search_point(&node.right, token, out);
        } else {
            for (_, _, reader) in &node.by_start {
                out.push(Arc::clone(reader));
            }
        }
    }

    /// Tables whose range intersects `[start, end]`.
    pub fn overlapping(&self, start: Token, end: Token) -> Vec<Arc<SSTableReader>> {
        let mut out = Vec::new();
        Self::search_range(&self.root, start, end, &mut out);
        out
    }

    fn search_range(
        node: &Option<Box<IntervalNode>>,
        start: Token,
        end: Token,
        out: &mut Vec<Arc<SSTableReader>>,
    ) {
        let Some(node) = node else { return };
        for (i_start, i_end, reader) in &node.by_start {
            if *i_start > end {
                break;
            }
            if *i_end >= start {
                out.push(Arc::clone(reader));
            }
        }
        if start < node.center {
            Self::search_range(&node.left, start, end, out);
        }
        if end > node.center {
            Self::search_range(&node.right, start, end, out);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Views
// ------------------------------------------------------------------------------------------------

/// One immutable snapshot of a store's live set.
pub struct View {
    /// The active (writable) memtable.
    pub memtable: Arc<Memtable>,
    /// Memtables switched out and awaiting flush completion, oldest first.
    pub flushing: Vec<Arc<Memtable>>,
    /// Live sorted tables.
    pub sstables: Vec<Arc<SSTableReader>>,
    /// Generations currently claimed by a running compaction.
    pub compacting: HashSet<u64>,
    interval_tree: IntervalTree,
}

impl View {
    fn new(
        memtable: Arc<Memtable>,
        flushing: Vec<Arc<Memtable>>,
        sstables: Vec<Arc<SSTableReader>>,
        compacting: HashSet<u64>,
    ) -> Arc<View> {
        let interval_tree = IntervalTree::build(&sstables);
        Arc::new(View {
            memtable,
            flushing,
            sstables,
            compacting,
            interval_tree,
        })
    }

    /// Tables whose range could contain the token.
    pub fn containing(&self, token: Token) -> Vec<Arc<SSTableReader>> {
        self.interval_tree.containing(token)
    }

    /// Tables whose range intersects `[start, end]`.
    pub fn overlapping(&self, start: Token, end: Token) -> Vec<Arc<SSTableReader>> {
        self.interval_tree.overlapping(start, end)
    }

    /// The live table with the given generation, if any.
    pub fn sstable(&self, generation: u64) -> Option<&Arc<SSTableReader>> {
        self.sstables
            .iter()
            .find(|reader| reader.generation() == generation)
    }
}

// ------------------------------------------------------------------------------------------------
// Tracker
// ------------------------------------------------------------------------------------------------

/// Publishes [`View`] snapshots and serializes the mutations that swap
/// them.
pub struct DataTracker {
    view: RwLock<Arc<View>>,
}

impl DataTracker {
    /// A tracker starting with one empty active memtable and no tables.
    pub fn new(memtable: Arc<Memtable>) -> Self {
        Self {
            view: RwLock::new(View::new(
                memtable,
                Vec::new(),
                Vec::new(),
                HashSet::new(),
            )),
        }
    }

    /// The current snapshot. Holders keep it for their whole operation.
    pub fn view(&self) -> Arc<View> {
        match self.view.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, build: impl FnOnce(&View) -> Arc<View>) {
        let mut guard = match self.view.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = build(&guard);
        *guard = next;
    }

    /// Moves the active memtable to the flushing list and installs
    /// `fresh` as active. Returns the switched-out memtable.
    pub fn switch_memtable(&self, fresh: Arc<Memtable>) -> Arc<Memtable> {
        let mut switched = None;
        self.swap(|view| {
            let old = Arc::clone(&view.memtable);
            let mut flushing = view.flushing.clone();
            flushing.push(Arc::clone(&old));
            switched = Some(old);
            View::new(
                fresh.clone(),
                flushing,
                view.sstables.clone(),
                view.compacting.clone(),
            )
        });
        // swap always runs the closure exactly once
        switched.unwrap_or_else(|| self.view().memtable.clone())
    }

    /// Completes a flush: drops `flushed` from the flushing list and, if
    /// the flush produced a table, adds its reader to the live set.
    pub fn replace_flushed(&self, flushed: &Arc<Memtable>, reader: Option<Arc<SSTableReader>>) {
        self.swap(|view| {
            let flushing: Vec<_> = view
                .flushing
                .iter()
                .filter(|m| !Arc::ptr_eq(m, flushed))
                .cloned()
                .collect();
            let mut sstables = view.sstables.clone();
            if let Some(reader) = reader {
                info!(descriptor = %reader.descriptor, "flushed sstable added to live set");
                sstables.push(reader);
            }
            View::new(
                view.memtable.clone(),
                flushing,
                sstables,
                view.compacting.clone(),
            )
        });
    }

    /// Adds recovered tables to the live set (startup only).
    pub fn add_sstables(&self, readers: Vec<Arc<SSTableReader>>) {
        self.swap(|view| {
            let mut sstables = view.sstables.clone();
            sstables.extend(readers);
            View::new(
                view.memtable.clone(),
                view.flushing.clone(),
                sstables,
                view.compacting.clone(),
            )
        });
    }

    /// Claims generations for a compaction. Fails (returning `false`,
    /// claiming nothing) if any is already claimed or no longer live.
    pub fn mark_compacting(&self, generations: &[u64]) -> bool {
        let mut claimed = false;
        self.swap(|view| {
            let all_live = generations
                .iter()
                .all(|gen| view.sstable(*gen).is_some() && !view.compacting.contains(gen));
            if !all_live {
                return View::new(
                    view.memtable.clone(),
                    view.flushing.clone(),
                    view.sstables.clone(),
                    view.compacting.clone(),
                );
            }
            claimed = true;
            let mut compacting = view.compacting.clone();
            compacting.extend(generations.iter().copied());
            View::new(
                view.memtable.clone(),
                view.flushing.clone(),
                view.sstables.clone(),
                compacting,
            )
        });
        claimed
    }

    /// Releases a compaction claim without replacing anything (abort
    /// path).
    pub fn unmark_compacting(&self, generations: &[u64]) {
        self.swap(|view| {
            let mut compacting = view.compacting.clone();
            for gen in generations {
                compacting.remove(gen);
            }
            View::new(
                view.memtable.clone(),
                view.flushing.clone(),
                view.sstables.clone(),
                compacting,
            )
        });
    }

    /// Atomically replaces compaction inputs with outputs and releases
    /// the claim. The inputs' files are deleted when their last readers
    /// drop; callers mark them compacted first.
    pub fn replace_compacted(
        &self,
        inputs: &[Arc<SSTableReader>],
        outputs: Vec<Arc<SSTableReader>>,
    ) {
        let input_gens: HashSet<u64> = inputs.iter().map(|r| r.generation()).collect();
        self.swap(|view| {
            let mut sstables: Vec<_> = view
                .sstables
                .iter()
                .filter(|reader| !input_gens.contains(&reader.generation()))
                .cloned()
                .collect();
            sstables.extend(outputs.iter().cloned());
            let mut compacting = view.compacting.clone();
            for gen in &input_gens {
                compacting.remove(gen);
            }
            debug!(
                inputs = inputs.len(),
                outputs = outputs.len(),
                live = sstables.len(),
                "replaced compacted sstables"
            );
            View::new(
                view.memtable.clone(),
                view.flushing.clone(),
                sstables,
                compacting,
            )
        });
    }

    /// Drops a suspect table from the live set without producing a
    /// replacement. Its files stay on disk for offline inspection.
    pub fn drop_suspect(&self, generation: u64) {
        self.swap(|view| {
            let sstables: Vec<_> = view
                .sstables
                .iter()
                .filter(|reader| reader.generation() != generation)
                .cloned()
                .collect();
            let mut compacting = view.compacting.clone();
            compacting.remove(&generation);
            View::new(
                view.memtable.clone(),
                view.flushing.clone(),
                sstables,
                compacting,
            )
        });
    }

    /// Drops every table from the live set, marking them for deletion on
    /// release (store teardown).
    pub fn invalidate(&self, fresh: Arc<Memtable>) {
        self.swap(|view| {
            for reader in &view.sstables {
                reader.mark_compacted();
            }
            View::new(fresh.clone(), Vec::new(), Vec::new(), HashSet::new())
        });
    }

    /// Creation time (seconds) of the oldest memtable not yet flushed —
    /// active or flushing.
    pub fn oldest_unflushed_memtable_secs(&self) -> u64 {
        let view = self.view();
        view.flushing
            .iter()
            .map(|m| m.creation_time_secs())
            .fold(view.memtable.creation_time_secs(), u64::min)
    }
}
