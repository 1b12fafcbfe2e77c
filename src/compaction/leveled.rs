//! # Leveled manifest
//!
//! The invariant-bearing layout of tables across levels:
//!
//! - L0 receives flushed tables and may overlap freely.
//! - Each Lk (k ≥ 1) is a non-overlapping partition of the key space,
//!   kept ordered by first key.
//! - Lk targets `base * 10^(k-1)` bytes, with `base` five times the
//!   maximum output table size; L0 is scored by table count instead.
//!
//! Candidate selection picks the level with the highest score ≥ 1
//! (ties to the lowest level). An L0 compaction takes a group of
//! mutually overlapping L0 tables plus every overlapping L1 table; an
//! Lk→Lk+1 compaction takes one Lk table — round-robin on the last
//! compacted key bound — plus every overlapping Lk+1 table.
//!
//! Level assignments persist in a CRC-guarded snapshot rewritten after
//! every mutation; recovery places unknown generations in L0 and demotes
//! any recovered table that would break the non-overlap invariant.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode};
use crate::row::DecoratedKey;
use crate::sstable::{RowView, SSTableError, SSTableReader, SSTableScanner};

use super::CompactionError;

/// Deepest level.
pub const MAX_LEVEL: usize = 8;
/// L0 table count that drives its score to 1.
pub const L0_COMPACTION_THRESHOLD: usize = 4;
/// Upper bound on L0 tables taken into one compaction.
pub const MAX_COMPACTING_L0: usize = 32;
/// Level size multiplier.
pub const LEVEL_FANOUT: u64 = 10;

const MANIFEST_MAGIC: [u8; 4] = *b"SBLM";

/// One selected compaction: the input tables and the level their outputs
/// land in.
#[derive(Clone)]
pub struct CompactionCandidate {
    /// Level the selection started from.
    pub level: usize,
    /// Level compaction outputs are inserted into.
    pub target_level: usize,
    /// Input tables.
    pub sstables: Vec<Arc<SSTableReader>>,
}

impl CompactionCandidate {
    /// Generations of the inputs.
    pub fn generations(&self) -> Vec<u64> {
        self.sstables.iter().map(|r| r.generation()).collect()
    }
}

/// The per-store level layout. Callers serialize access (the store keeps
/// it behind a mutex).
pub struct LeveledManifest {
    levels: Vec<Vec<Arc<SSTableReader>>>,
    last_compacted: Vec<Option<DecoratedKey>>,
    max_sstable_size: u64,
    snapshot_path: PathBuf,
}

impl LeveledManifest {
    /// An empty manifest persisting to `snapshot_path`.
    pub fn new(snapshot_path: PathBuf, max_sstable_size: u64) -> Self {
        Self {
            levels: vec![Vec::new(); MAX_LEVEL + 1],
            last_compacted: vec![None; MAX_LEVEL + 1],
            max_sstable_size,
            snapshot_path,
        }
    }

    /// Reads a persisted snapshot into a generation → level map.
    /// A missing file is an empty layout.
    pub fn read_snapshot(path: &std::path::Path) -> Result<HashMap<u64, usize>, CompactionError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 8 || bytes[..4] != MANIFEST_MAGIC {
            return Err(CompactionError::Internal(
                "level snapshot: bad magic".into(),
            ));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(body) != stored {
            return Err(CompactionError::Internal(
                "level snapshot: CRC mismatch".into(),
            ));
        }
        let mut off = 4;
        let (level_count, n) = u32::decode_from(&body[off..])
            .map_err(|e| CompactionError::Internal(format!("level snapshot: {e}")))?;
        off += n;
        let mut map = HashMap::new();
        for level in 0..level_count as usize {
            let (generations, n) = encoding::decode_seq::<u64>(&body[off..])
                .map_err(|e| CompactionError::Internal(format!("level snapshot: {e}")))?;
            off += n;
            for generation in generations {
                map.insert(generation, level);
            }
        }
        Ok(map)
    }

    fn persist(&self) -> Result<(), CompactionError> {
        let mut body = Vec::new();
        body.extend_from_slice(&MANIFEST_MAGIC);
        ((MAX_LEVEL + 1) as u32)
            .encode_to(&mut body)
            .map_err(|e| CompactionError::Internal(e.to_string()))?;
        for level in &self.levels {
            let generations: Vec<u64> = level.iter().map(|r| r.generation()).collect();
            encoding::encode_seq(&generations, &mut body)
                .map_err(|e| CompactionError::Internal(e.to_string()))?;
        }
        body.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

        let tmp = self.snapshot_path.with_extension("tmp");
        fs::write(&tmp, &body)?;
        fs::rename(&tmp, &self.snapshot_path)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// Number of tables in a level.
    pub fn level_count(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Vec::len)
    }

    /// Total Data bytes in a level.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map_or(0, |l| l.iter().map(|r| r.data_size()).sum())
    }

    /// The tables of a level, in first-key order for k ≥ 1.
    pub fn level(&self, level: usize) -> &[Arc<SSTableReader>] {
        self.levels.get(level).map_or(&[], Vec::as_slice)
    }

    /// The level a generation currently sits in.
    pub fn level_of(&self, generation: u64) -> Option<usize> {
        self.levels.iter().position(|level| {
            level.iter().any(|reader| reader.generation() == generation)
        })
    }

    /// Every table across all levels.
    pub fn all_sstables(&self) -> Vec<Arc<SSTableReader>> {
        self.levels.iter().flatten().cloned().collect()
    }

    fn target_bytes(&self, level: usize) -> u64 {
        let base = 5 * self.max_sstable_size;
        base * LEVEL_FANOUT.pow(level.saturating_sub(1) as u32)
    }

    /// `size / target` for a level; L0 is scored by table count.
    pub fn score(&self, level: usize) -> f64 {
        if level == 0 {
            self.level_count(0) as f64 / L0_COMPACTION_THRESHOLD as f64
        } else {
            self.level_bytes(level) as f64 / self.target_bytes(level) as f64
        }
    }

    // --------------------------------------------------------------------------------------------
    // Mutation
    // --------------------------------------------------------------------------------------------

    /// Adds a freshly flushed table to L0.
    pub fn add_flushed(&mut self, reader: Arc<SSTableReader>) -> Result<(), CompactionError> {
        self.levels[0].push(reader);
        self.persist()
    }

    /// Places a recovered table in its persisted level, demoting it to
    /// L0 if that placement would overlap a sibling.
    pub fn add_recovered(
        &mut self,
        reader: Arc<SSTableReader>,
        level: usize,
    ) -> Result<(), CompactionError> {
        let level = level.min(MAX_LEVEL);
        if level == 0 || !self.fits_disjoint(level, &reader) {
            if level != 0 {
                warn!(
                    descriptor = %reader.descriptor,
                    level,
                    "recovered table overlaps its level, demoting to L0"
                );
            }
            self.levels[0].push(reader);
        } else {
            Self::insert_ordered(&mut self.levels[level], reader);
        }
        self.persist()
    }

    fn fits_disjoint(&self, level: usize, reader: &Arc<SSTableReader>) -> bool {
        self.levels[level]
            .iter()
            .all(|sibling| !overlaps(sibling, reader))
    }

    fn insert_ordered(level: &mut Vec<Arc<SSTableReader>>, reader: Arc<SSTableReader>) {
        let at = level.partition_point(|r| r.first() <= reader.first());
        level.insert(at, reader);
    }

    /// Applies a compaction: removes `inputs` from their levels and
    /// inserts `outputs` into `target_level` preserving first-key order.
    ///
    /// # Panics
    ///
    /// Panics if the resulting target level violates the non-overlap
    /// invariant — that is a bug, not a recoverable condition.
    pub fn replace(
        &mut self,
        inputs: &[Arc<SSTableReader>],
        outputs: &[Arc<SSTableReader>],
        target_level: usize,
    ) -> Result<(), CompactionError> {
        let target_level = target_level.min(MAX_LEVEL);
        let input_gens: HashSet<u64> = inputs.iter().map(|r| r.generation()).collect();
        for level in &mut self.levels {
            level.retain(|reader| !input_gens.contains(&reader.generation()));
        }
        for output in outputs {
            if target_level == 0 {
                self.levels[0].push(Arc::clone(output));
            } else {
                Self::insert_ordered(&mut self.levels[target_level], Arc::clone(output));
            }
        }
        self.verify_disjoint(target_level);
        if let Some(last) = outputs.last() {
            self.last_compacted[target_level.saturating_sub(1)] = Some(last.last().clone());
        }
        info!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            target_level,
            "manifest replaced compacted tables"
        );
        self.persist()
    }

    fn verify_disjoint(&self, level: usize) {
        if level == 0 {
            return;
        }
        let tables = &self.levels[level];
        for pair in tables.windows(2) {
            assert!(
                pair[0].last() < pair[1].first(),
                "level {level} overlap between {} and {}",
                pair[0].descriptor,
                pair[1].descriptor
            );
        }
    }

    // --------------------------------------------------------------------------------------------
    // Candidate selection
    // --------------------------------------------------------------------------------------------

    /// Picks the next compaction, skipping tables already claimed by a
    /// running compaction. Returns `None` when no level scores ≥ 1 or
    /// the winning level's candidates are all claimed.
    pub fn compaction_candidates(
        &self,
        compacting: &HashSet<u64>,
    ) -> Option<CompactionCandidate> {
        let mut best: Option<(usize, f64)> = None;
        for level in 0..MAX_LEVEL {
            if self.level_count(level) == 0 {
                continue;
            }
            let score = self.score(level);
            if score >= 1.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((level, score));
            }
        }
        let (level, score) = best?;
        debug!(level, score, "selecting compaction candidates");

        let candidate = if level == 0 {
            self.l0_candidates(compacting)?
        } else {
            self.leveled_candidates(level, compacting)?
        };
        if candidate
            .sstables
            .iter()
            .any(|r| compacting.contains(&r.generation()))
        {
            return None;
        }
        Some(candidate)
    }

    /// The whole of L0 plus every overlapping L1 table, regardless of
    /// score — the first round of a major compaction. `None` when L0 is
    /// empty or any candidate is claimed.
    pub fn forced_l0_candidates(
        &self,
        compacting: &HashSet<u64>,
    ) -> Option<CompactionCandidate> {
        if self.levels[0].is_empty() {
            return None;
        }
        let mut group: Vec<Arc<SSTableReader>> = self.levels[0].to_vec();
        let mut first = group.first()?.first().clone();
        let mut last = group.first()?.last().clone();
        for reader in &group {
            if reader.first() < &first {
                first = reader.first().clone();
            }
            if reader.last() > &last {
                last = reader.last().clone();
            }
        }
        for reader in &self.levels[1] {
            if reader.first() <= &last && reader.last() >= &first {
                group.push(Arc::clone(reader));
            }
        }
        if group
            .iter()
            .any(|r| compacting.contains(&r.generation()))
        {
            return None;
        }
        Some(CompactionCandidate {
            level: 0,
            target_level: 1,
            sstables: group,
        })
    }

    fn l0_candidates(&self, compacting: &HashSet<u64>) -> Option<CompactionCandidate> {
        let seed = self.levels[0]
            .iter()
            .find(|r| !compacting.contains(&r.generation()))?;

        // grow a mutually overlapping group around the seed
        let mut group: Vec<Arc<SSTableReader>> = vec![Arc::clone(seed)];
        let (mut first, mut last) = (seed.first().clone(), seed.last().clone());
        let mut grew = true;
        while grew && group.len() < MAX_COMPACTING_L0 {
            grew = false;
            for reader in &self.levels[0] {
                if group.len() >= MAX_COMPACTING_L0 {
                    break;
                }
                if group.iter().any(|g| Arc::ptr_eq(g, reader))
                    || compacting.contains(&reader.generation())
                {
                    continue;
                }
                if reader.first() <= &last && reader.last() >= &first {
                    first = if reader.first() < &first {
                        reader.first().clone()
                    } else {
                        first
                    };
                    last = if reader.last() > &last {
                        reader.last().clone()
                    } else {
                        last
                    };
                    group.push(Arc::clone(reader));
                    grew = true;
                }
            }
        }

        // plus every L1 table overlapping the union
        for reader in &self.levels[1] {
            if reader.first() <= &last && reader.last() >= &first {
                group.push(Arc::clone(reader));
            }
        }

        Some(CompactionCandidate {
            level: 0,
            target_level: 1,
            sstables: group,
        })
    }

    fn leveled_candidates(
        &self,
        level: usize,
        compacting: &HashSet<u64>,
    ) -> Option<CompactionCandidate> {
        let tables = &self.levels[level];
        // round-robin: first table past the last compacted bound, wrapping
        let start = match &self.last_compacted[level] {
            Some(bound) => tables.partition_point(|r| r.first() <= bound),
            None => 0,
        };
        let seed = (0..tables.len())
            .map(|i| &tables[(start + i) % tables.len()])
            .find(|r| !compacting.contains(&r.generation()))?;

        let mut group: Vec<Arc<SSTableReader>> = vec![Arc::clone(seed)];
        for reader in &self.levels[level + 1] {
            if reader.first() <= seed.last() && reader.last() >= seed.first() {
                group.push(Arc::clone(reader));
            }
        }
        Some(CompactionCandidate {
            level,
            target_level: level + 1,
            sstables: group,
        })
    }
}

fn overlaps(a: &Arc<SSTableReader>, b: &Arc<SSTableReader>) -> bool {
    a.first() <= b.last() && b.first() <= a.last()
}

// ------------------------------------------------------------------------------------------------
// Positional scanner
// ------------------------------------------------------------------------------------------------

/// Sequential scanner over a collection of non-overlapping tables, in
/// first-key order, reporting its position as total Data bytes read.
///
/// After exhausting the scanner, `current_position` equals the summed
/// Data size of the whole input set.
pub struct LeveledScanner {
    scanners: Vec<SSTableScanner>,
    current: usize,
    completed_bytes: u64,
}

impl LeveledScanner {
    /// A scanner over `sstables`, sorted by first key.
    pub fn new(mut sstables: Vec<Arc<SSTableReader>>) -> Self {
        sstables.sort_by(|a, b| a.first().cmp(b.first()));
        Self {
            scanners: sstables.iter().map(SSTableReader::scanner).collect(),
            current: 0,
            completed_bytes: 0,
        }
    }

    /// Total Data bytes consumed so far.
    pub fn current_position(&self) -> u64 {
        self.completed_bytes
            + self
                .scanners
                .get(self.current)
                .map_or(0, SSTableScanner::current_position)
    }

    /// The next row across the input set.
    pub fn next_row(&mut self) -> Result<Option<RowView>, SSTableError> {
        while self.current < self.scanners.len() {
            match self.scanners[self.current].next_row()? {
                Some(view) => return Ok(Some(view)),
                None => {
                    self.completed_bytes += self.scanners[self.current].current_position();
                    self.current += 1;
                }
            }
        }
        Ok(None)
    }
}
