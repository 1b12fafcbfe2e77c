//! K-way merge of per-row atom streams.
//!
//! Inputs are already partition-aligned: each cursor holds one row's
//! atoms from one table, ordered by the clustering comparator. The merge
//! yields a single ordered stream in which equal-named cells have been
//! reduced by the reconciliation rules; range tombstones pass through in
//! start-name order, ahead of cells with the same name.
//!
//! The reducer notifies the secondary-index updater whenever a
//! previously-written cell loses to a newer cell with a different value.

use std::cmp::Ordering;

use crate::row::{
    Atom, Cell, ClusteringComparator, DecoratedKey, DeletionTime, RangeTombstone, RowData,
};
use crate::sstable::{OwnedAtomCursor, SSTableError};
use crate::store::SecondaryIndexes;

/// Merges the atom streams of one partition's row fragments.
pub struct MergedAtomStream<'a> {
    comparator: ClusteringComparator,
    sources: Vec<OwnedAtomCursor>,
    heads: Vec<Option<Atom>>,
    key: &'a DecoratedKey,
    indexer: Option<&'a dyn SecondaryIndexes>,
}

impl<'a> MergedAtomStream<'a> {
    /// Primes every cursor and returns the merged stream.
    pub fn new(
        comparator: ClusteringComparator,
        mut sources: Vec<OwnedAtomCursor>,
        key: &'a DecoratedKey,
        indexer: Option<&'a dyn SecondaryIndexes>,
    ) -> Result<Self, SSTableError> {
        let mut heads = Vec::with_capacity(sources.len());
        for cursor in &mut sources {
            heads.push(cursor.next_atom()?);
        }
        Ok(Self {
            comparator,
            sources,
            heads,
            key,
            indexer,
        })
    }

    /// Ordering across the merge frontier: by name, with range
    /// tombstones ahead of cells at the same name.
    fn atom_order(&self, a: &Atom, b: &Atom) -> Ordering {
        self.comparator.cmp(a.name(), b.name()).then_with(|| {
            let rank = |atom: &Atom| match atom {
                Atom::Range(_) => 0u8,
                Atom::Cell(_) => 1u8,
            };
            rank(a).cmp(&rank(b))
        })
    }

    fn refill(&mut self, source: usize) -> Result<(), SSTableError> {
        self.heads[source] = self.sources[source].next_atom()?;
        Ok(())
    }

    /// The next reduced atom, or `None` when every source is exhausted.
    pub fn next_atom(&mut self) -> Result<Option<Atom>, SSTableError> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(atom) = head else { continue };
            match best {
                None => best = Some(i),
                Some(b) => {
                    if let Some(current) = &self.heads[b] {
                        if self.atom_order(atom, current) == Ordering::Less {
                            best = Some(i);
                        }
                    }
                }
            }
        }
        let Some(best) = best else {
            return Ok(None);
        };

        let atom = self.heads[best].take();
        self.refill(best)?;
        let Some(atom) = atom else {
            return Ok(None);
        };

        match atom {
            Atom::Range(rt) => Ok(Some(Atom::Range(rt))),
            Atom::Cell(winner) => {
                // gather every other source's cell with the same name
                let mut winner = winner;
                let mut losers: Vec<Cell> = Vec::new();
                for i in 0..self.heads.len() {
                    loop {
                        let same = matches!(
                            &self.heads[i],
                            Some(Atom::Cell(cell))
                                if self.comparator.cmp(cell.name(), winner.name())
                                    == Ordering::Equal
                        );
                        if !same {
                            break;
                        }
                        if let Some(Atom::Cell(cell)) = self.heads[i].take() {
                            let merged = winner.clone().reconcile(cell.clone());
                            if merged != winner {
                                losers.push(winner);
                            } else if merged != cell {
                                losers.push(cell);
                            }
                            winner = merged;
                        }
                        self.refill(i)?;
                    }
                }
                if let Some(indexer) = self.indexer {
                    if indexer.has_indexes() {
                        for loser in &losers {
                            if !loser.is_tombstone() && loser.value() != winner.value() {
                                indexer.remove(self.key, loser);
                            }
                        }
                    }
                }
                Ok(Some(Atom::Cell(winner)))
            }
        }
    }
}

/// Fully merges fragments into an in-memory row: the precompacted path.
/// Top-level deletions reduce to the newest; range tombstones gather
/// into the row's deletion info.
pub fn merge_into_row(
    comparator: &ClusteringComparator,
    key: &DecoratedKey,
    deletions: &[DeletionTime],
    cursors: Vec<OwnedAtomCursor>,
    indexer: Option<&dyn SecondaryIndexes>,
) -> Result<RowData, SSTableError> {
    let mut row = RowData::empty();
    for deletion in deletions {
        if deletion.marked_for_delete_at > row.deletion.top.marked_for_delete_at {
            row.deletion.top = *deletion;
        }
    }
    let mut stream = MergedAtomStream::new(*comparator, cursors, key, indexer)?;
    while let Some(atom) = stream.next_atom()? {
        match atom {
            Atom::Cell(cell) => {
                row.add_cell(comparator, cell);
            }
            Atom::Range(rt) => row.deletion.add_range(comparator, rt),
        }
    }
    Ok(row)
}

/// Streaming shadow/purge filter over a merged atom stream.
///
/// Every range tombstone seen is retained for shadow checks against later
/// cells even when the purge drops it from the output, so in-row shadowing
/// is identical whether or not a purge runs.
pub struct PurgedAtomStream<'a> {
    inner: MergedAtomStream<'a>,
    comparator: ClusteringComparator,
    top: DeletionTime,
    gathered: Vec<RangeTombstone>,
    purge: bool,
    gc_before: i32,
    merge_shard_before: Option<i64>,
}

impl<'a> PurgedAtomStream<'a> {
    /// Wraps `inner`, shadowing against `top` and purging below
    /// `gc_before` when `purge` holds. `merge_shard_before` enables
    /// counter-shard expiry for commutative stores.
    pub fn new(
        inner: MergedAtomStream<'a>,
        comparator: ClusteringComparator,
        top: DeletionTime,
        purge: bool,
        gc_before: i32,
        merge_shard_before: Option<i64>,
    ) -> Self {
        Self {
            inner,
            comparator,
            top,
            gathered: Vec::new(),
            purge,
            gc_before,
            merge_shard_before,
        }
    }

    /// The row-level deletion time the output row should carry.
    pub fn output_deletion(&self) -> DeletionTime {
        if self.purge && self.top.local_deletion_time < self.gc_before {
            DeletionTime::LIVE
        } else {
            self.top
        }
    }

    /// The next surviving atom.
    pub fn next_atom(&mut self) -> Result<Option<Atom>, SSTableError> {
        loop {
            let Some(atom) = self.inner.next_atom()? else {
                return Ok(None);
            };
            match atom {
                Atom::Range(rt) => {
                    let droppable = self.purge && rt.local_deletion_time < self.gc_before;
                    self.gathered.push(rt.clone());
                    if !droppable {
                        return Ok(Some(Atom::Range(rt)));
                    }
                }
                Atom::Cell(cell) => {
                    let shadowed = cell.timestamp() <= self.top.marked_for_delete_at
                        || self.gathered.iter().any(|rt| {
                            rt.timestamp >= cell.timestamp()
                                && rt.covers(&self.comparator, cell.name())
                        });
                    if shadowed {
                        continue;
                    }
                    if self.purge && cell.local_deletion_time() < self.gc_before {
                        continue;
                    }
                    let cell = match (self.purge, self.merge_shard_before, cell) {
                        (
                            true,
                            Some(before),
                            Cell::Counter {
                                name,
                                mut shards,
                                timestamp,
                            },
                        ) => {
                            if shards.len() > 1 {
                                shards.retain(|s| (s.clock as i64) >= before);
                            }
                            Cell::Counter {
                                name,
                                shards,
                                timestamp,
                            }
                        }
                        (_, _, cell) => cell,
                    };
                    return Ok(Some(Atom::Cell(cell)));
                }
            }
        }
    }
}
