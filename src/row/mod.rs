//! # Wide-column data model
//!
//! The vocabulary shared by every other module:
//!
//! - [`DecoratedKey`] — a partition key decorated with its partitioner
//!   [`Token`]; on-disk partition order is `(token, key bytes)`.
//! - [`Cell`] — one column instance: live, expiring, deleted (tombstone)
//!   or counter. Cells within a row are ordered by the store's
//!   [`ClusteringComparator`].
//! - [`RangeTombstone`] — a deletion covering a clustering-name interval.
//! - [`DeletionInfo`] — row-level deletion time plus the ordered set of
//!   range tombstones.
//! - [`RowData`] / [`Row`] — the merged, comparator-ordered cell set for
//!   one partition, with the reconciliation and purge rules.
//!
//! ## Reconciliation
//!
//! Two cells with the same name resolve deterministically:
//! live vs live by timestamp, ties by value bytes (greater wins);
//! live vs tombstone by timestamp, tie goes to the tombstone;
//! tombstone vs tombstone by timestamp then local deletion time;
//! counters merge their shard sets instead of picking a winner.
//!
//! ## Delete preservation
//!
//! [`RowData::remove_deleted`] with `gc_before == i32::MIN` strips only
//! cells shadowed by their containing row or range tombstones and never
//! drops a tombstone itself. A real `gc_before` additionally purges
//! tombstones (cell, range and row level) whose local deletion time is
//! older than the threshold. Write paths always use the `i32::MIN` form.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::stats::StreamingHistogram;

// ------------------------------------------------------------------------------------------------
// Tokens and partitioners
// ------------------------------------------------------------------------------------------------

/// A partitioner-assigned position on the token ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

impl Token {
    /// Smallest possible token.
    pub const MIN: Token = Token(i64::MIN);
    /// Largest possible token.
    pub const MAX: Token = Token(i64::MAX);
}

/// Maps raw partition-key bytes onto the token ring.
///
/// The partitioner's identity is recorded in every table's statistics
/// sidecar and asserted on load: tables written under a different
/// partitioner refuse to open.
pub trait Partitioner: Send + Sync {
    /// Token for the given key bytes.
    fn token(&self, key: &[u8]) -> Token;

    /// Stable identifier persisted in the statistics sidecar.
    fn name(&self) -> &'static str;

    /// Decorates raw key bytes.
    fn decorate(&self, key: Vec<u8>) -> DecoratedKey {
        DecoratedKey {
            token: self.token(&key),
            key,
        }
    }
}

/// Keeps keys in byte order: the token is the first eight key bytes,
/// offset so that token order equals unsigned byte order.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderPreservingPartitioner;

impl Partitioner for OrderPreservingPartitioner {
    fn token(&self, key: &[u8]) -> Token {
        let mut bytes = [0u8; 8];
        for (i, b) in key.iter().take(8).enumerate() {
            bytes[i] = *b;
        }
        // flip the sign bit so unsigned byte order maps onto i64 order
        Token((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
    }

    fn name(&self) -> &'static str {
        "OrderPreservingPartitioner"
    }
}

/// Distributes keys uniformly with a 64-bit finalizer mix.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn token(&self, key: &[u8]) -> Token {
        let mut h: u64 = 0x9E37_79B9_7F4A_7C15;
        for chunk in key.chunks(8) {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            h ^= u64::from_le_bytes(bytes);
            h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
            h ^= h >> 27;
            h = h.wrapping_mul(0x94D0_49BB_1331_11EB);
            h ^= h >> 31;
        }
        Token(h as i64)
    }

    fn name(&self) -> &'static str {
        "HashPartitioner"
    }
}

/// A partition key plus its token. Partition order on disk and in the
/// memtable is `(token, key bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoratedKey {
    /// Position on the token ring.
    pub token: Token,
    /// Raw partition-key bytes.
    pub key: Vec<u8>,
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ------------------------------------------------------------------------------------------------
// Clustering comparator
// ------------------------------------------------------------------------------------------------

/// End-of-component marker meaning "sorts before any real value".
pub const EOC_BEFORE: u8 = 0xFF;
/// End-of-component marker for an exact component value.
pub const EOC_EQUAL: u8 = 0x00;
/// End-of-component marker meaning "sorts after any real value".
pub const EOC_AFTER: u8 = 0x01;

/// Ordering of cell names within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringComparator {
    /// Plain lexicographic byte order.
    Bytes,
    /// Composite names: a sequence of `[u16 len][bytes][u8 eoc]`
    /// components. The end-of-component byte encodes query bounds:
    /// [`EOC_BEFORE`] sorts before every real value of the component,
    /// [`EOC_AFTER`] after, [`EOC_EQUAL`] is an exact value.
    Composite,
}

impl ClusteringComparator {
    /// Compares two cell names under this ordering.
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            ClusteringComparator::Bytes => a.cmp(b),
            ClusteringComparator::Composite => composite_cmp(a, b),
        }
    }
}

fn next_component(buf: &[u8]) -> Option<(&[u8], i8, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len + 1 {
        return None;
    }
    let component = &buf[2..2 + len];
    let eoc = buf[2 + len] as i8;
    Some((component, eoc, &buf[2 + len + 1..]))
}

fn composite_cmp(mut a: &[u8], mut b: &[u8]) -> Ordering {
    loop {
        match (next_component(a), next_component(b)) {
            (None, None) => return Ordering::Equal,
            // a is a strict prefix: its own final eoc already compared
            // equal, so the shorter side sorts first
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ca, ea, rest_a)), Some((cb, eb, rest_b))) => {
                match ca.cmp(cb) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match ea.cmp(&eb) {
                    Ordering::Equal => {}
                    other => return other,
                }
                a = rest_a;
                b = rest_b;
            }
        }
    }
}

/// Builds one composite name component (`[u16 len][bytes][u8 eoc]`).
pub fn composite_component(bytes: &[u8], eoc: u8, out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
    out.push(eoc);
}

// ------------------------------------------------------------------------------------------------
// Cells
// ------------------------------------------------------------------------------------------------

/// One shard of a distributed counter: `(id, clock, count)`. Shards with
/// the same id resolve to the highest clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterShard {
    /// Counter-id that owns this shard.
    pub id: u64,
    /// Logical clock for the shard; higher supersedes lower.
    pub clock: u64,
    /// Accumulated count at that clock.
    pub count: i64,
}

impl Encode for CounterShard {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.clock.encode_to(buf)?;
        self.count.encode_to(buf)
    }
}

impl Decode for CounterShard {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, mut off) = u64::decode_from(buf)?;
        let (clock, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (count, n) = i64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { id, clock, count }, off))
    }
}

/// One column instance within a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// A regular live column.
    Live {
        name: Vec<u8>,
        value: Vec<u8>,
        timestamp: i64,
    },
    /// A live column that expires: `local_deletion_time` is the wall-clock
    /// second at which it becomes deleted.
    Expiring {
        name: Vec<u8>,
        value: Vec<u8>,
        timestamp: i64,
        ttl: i32,
        local_deletion_time: i32,
    },
    /// A cell tombstone.
    Deleted {
        name: Vec<u8>,
        timestamp: i64,
        local_deletion_time: i32,
    },
    /// A commutative counter column carrying its shard set.
    Counter {
        name: Vec<u8>,
        shards: Vec<CounterShard>,
        timestamp: i64,
    },
}

impl Cell {
    /// The clustering name of this cell.
    pub fn name(&self) -> &[u8] {
        match self {
            Cell::Live { name, .. }
            | Cell::Expiring { name, .. }
            | Cell::Deleted { name, .. }
            | Cell::Counter { name, .. } => name,
        }
    }

    /// Write timestamp of this cell.
    pub fn timestamp(&self) -> i64 {
        match self {
            Cell::Live { timestamp, .. }
            | Cell::Expiring { timestamp, .. }
            | Cell::Deleted { timestamp, .. }
            | Cell::Counter { timestamp, .. } => *timestamp,
        }
    }

    /// True for cell tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Cell::Deleted { .. })
    }

    /// Local deletion time for tombstones and expiring cells;
    /// `i32::MAX` for cells that never become droppable.
    pub fn local_deletion_time(&self) -> i32 {
        match self {
            Cell::Deleted {
                local_deletion_time,
                ..
            }
            | Cell::Expiring {
                local_deletion_time,
                ..
            } => *local_deletion_time,
            _ => i32::MAX,
        }
    }

    /// Value bytes for live and expiring cells; empty otherwise.
    pub fn value(&self) -> &[u8] {
        match self {
            Cell::Live { value, .. } | Cell::Expiring { value, .. } => value,
            _ => &[],
        }
    }

    /// Exact size of this cell in the on-disk atom stream.
    pub fn serialized_size(&self) -> u64 {
        let base = 1 + 4 + self.name().len() as u64;
        match self {
            Cell::Live { value, .. } => base + 4 + value.len() as u64 + 8,
            Cell::Expiring { value, .. } => base + 4 + value.len() as u64 + 8 + 4 + 4,
            Cell::Deleted { .. } => base + 8 + 4,
            Cell::Counter { shards, .. } => base + 4 + 24 * shards.len() as u64 + 8,
        }
    }

    /// Deterministically resolves two cells with the same name. The
    /// caller guarantees `self.name() == other.name()`.
    pub fn reconcile(self, other: Cell) -> Cell {
        match (self, other) {
            (
                Cell::Counter {
                    name,
                    shards: a,
                    timestamp: ts_a,
                },
                Cell::Counter {
                    shards: b,
                    timestamp: ts_b,
                    ..
                },
            ) => Cell::Counter {
                name,
                shards: merge_shards(a, b),
                timestamp: ts_a.max(ts_b),
            },
            (a @ Cell::Deleted { .. }, b @ Cell::Deleted { .. }) => {
                let order = a
                    .timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.local_deletion_time().cmp(&b.local_deletion_time()));
                if order == Ordering::Less {
                    b
                } else {
                    a
                }
            }
            // tombstone wins ties against live data
            (a @ Cell::Deleted { .. }, b) => {
                if b.timestamp() > a.timestamp() {
                    b
                } else {
                    a
                }
            }
            (a, b @ Cell::Deleted { .. }) => {
                if a.timestamp() > b.timestamp() {
                    a
                } else {
                    b
                }
            }
            (a, b) => {
                match a
                    .timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.value().cmp(b.value()))
                {
                    Ordering::Less => b,
                    _ => a,
                }
            }
        }
    }

    /// Feeds this cell into a row digest.
    pub fn update_digest(&self, hasher: &mut Sha256) {
        hasher.update(self.name());
        hasher.update(self.timestamp().to_le_bytes());
        match self {
            Cell::Live { value, .. } => {
                hasher.update([0u8]);
                hasher.update(value);
            }
            Cell::Expiring {
                value,
                ttl,
                local_deletion_time,
                ..
            } => {
                hasher.update([1u8]);
                hasher.update(value);
                hasher.update(ttl.to_le_bytes());
                hasher.update(local_deletion_time.to_le_bytes());
            }
            Cell::Deleted {
                local_deletion_time,
                ..
            } => {
                hasher.update([2u8]);
                hasher.update(local_deletion_time.to_le_bytes());
            }
            Cell::Counter { shards, .. } => {
                hasher.update([3u8]);
                for shard in shards {
                    hasher.update(shard.id.to_le_bytes());
                    hasher.update(shard.clock.to_le_bytes());
                    hasher.update(shard.count.to_le_bytes());
                }
            }
        }
    }
}

/// Merges two shard sets: one shard per id, highest clock wins.
fn merge_shards(a: Vec<CounterShard>, b: Vec<CounterShard>) -> Vec<CounterShard> {
    let mut merged: Vec<CounterShard> = a;
    for shard in b {
        match merged.iter_mut().find(|s| s.id == shard.id) {
            Some(existing) => {
                if shard.clock > existing.clock {
                    *existing = shard;
                }
            }
            None => merged.push(shard),
        }
    }
    merged.sort_by_key(|s| s.id);
    merged
}

// ------------------------------------------------------------------------------------------------
// Tombstones and deletion info
// ------------------------------------------------------------------------------------------------

/// A deletion covering the clustering-name interval `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// Inclusive start name.
    pub start: Vec<u8>,
    /// Inclusive end name.
    pub end: Vec<u8>,
    /// Deletion timestamp: shadows cells at or below it.
    pub timestamp: i64,
    /// Wall-clock second of the deletion, for purge eligibility.
    pub local_deletion_time: i32,
}

impl RangeTombstone {
    /// Exact size of this tombstone in the on-disk atom stream.
    pub fn serialized_size(&self) -> u64 {
        1 + 4 + self.start.len() as u64 + 4 + self.end.len() as u64 + 8 + 4
    }

    /// True if `name` falls inside this tombstone's interval.
    pub fn covers(&self, comparator: &ClusteringComparator, name: &[u8]) -> bool {
        comparator.cmp(&self.start, name) != Ordering::Greater
            && comparator.cmp(name, &self.end) != Ordering::Greater
    }
}

/// Row-level deletion time: everything written at or before
/// `marked_for_delete_at` is shadowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionTime {
    /// Shadow timestamp; `i64::MIN` when the row is live.
    pub marked_for_delete_at: i64,
    /// Wall-clock second of the deletion; `i32::MAX` when live.
    pub local_deletion_time: i32,
}

impl DeletionTime {
    /// The "not deleted" sentinel.
    pub const LIVE: DeletionTime = DeletionTime {
        marked_for_delete_at: i64::MIN,
        local_deletion_time: i32::MAX,
    };

    /// True if no row-level deletion is recorded.
    pub fn is_live(&self) -> bool {
        *self == DeletionTime::LIVE
    }
}

impl Encode for DeletionTime {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.marked_for_delete_at.encode_to(buf)?;
        self.local_deletion_time.encode_to(buf)
    }
}

impl Decode for DeletionTime {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (marked_for_delete_at, mut off) = i64::decode_from(buf)?;
        let (local_deletion_time, n) = i32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                marked_for_delete_at,
                local_deletion_time,
            },
            off,
        ))
    }
}

/// Row-level deletion info: the top-level deletion time plus the ordered
/// range tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionInfo {
    /// Top-level (whole-row) deletion.
    pub top: DeletionTime,
    /// Range tombstones, ordered by start name.
    pub ranges: Vec<RangeTombstone>,
}

impl DeletionInfo {
    /// No deletion at all.
    pub fn live() -> Self {
        Self {
            top: DeletionTime::LIVE,
            ranges: Vec::new(),
        }
    }

    /// A whole-row deletion at the given timestamps.
    pub fn deleted_at(marked_for_delete_at: i64, local_deletion_time: i32) -> Self {
        Self {
            top: DeletionTime {
                marked_for_delete_at,
                local_deletion_time,
            },
            ranges: Vec::new(),
        }
    }

    /// True when neither a row deletion nor any range tombstone exists.
    pub fn is_live(&self) -> bool {
        self.top.is_live() && self.ranges.is_empty()
    }

    /// Inserts a range tombstone preserving start-name order.
    pub fn add_range(&mut self, comparator: &ClusteringComparator, rt: RangeTombstone) {
        let at = self
            .ranges
            .partition_point(|r| comparator.cmp(&r.start, &rt.start) != Ordering::Greater);
        self.ranges.insert(at, rt);
    }

    /// Merges another deletion info into this one.
    pub fn merge(&mut self, comparator: &ClusteringComparator, other: &DeletionInfo) {
        if other.top.marked_for_delete_at > self.top.marked_for_delete_at {
            self.top = other.top;
        }
        for rt in &other.ranges {
            self.add_range(comparator, rt.clone());
        }
    }

    /// True if `cell` is shadowed by the row deletion or a covering
    /// range tombstone.
    pub fn is_deleted(&self, comparator: &ClusteringComparator, cell: &Cell) -> bool {
        if cell.timestamp() <= self.top.marked_for_delete_at {
            return true;
        }
        self.ranges
            .iter()
            .any(|rt| rt.timestamp >= cell.timestamp() && rt.covers(comparator, cell.name()))
    }

    /// Greatest deletion timestamp recorded here, or `i64::MIN`.
    pub fn max_timestamp(&self) -> i64 {
        self.ranges
            .iter()
            .map(|rt| rt.timestamp)
            .fold(self.top.marked_for_delete_at, i64::max)
    }

    /// Number of range tombstones.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Drops tombstones whose local deletion time precedes `gc_before`.
    pub fn purge(&mut self, gc_before: i32) {
        if self.top.local_deletion_time < gc_before {
            self.top = DeletionTime::LIVE;
        }
        self.ranges.retain(|rt| rt.local_deletion_time >= gc_before);
    }
}

// ------------------------------------------------------------------------------------------------
// Atoms — the on-disk stream unit
// ------------------------------------------------------------------------------------------------

const ATOM_LIVE: u8 = 0;
const ATOM_EXPIRING: u8 = 1;
const ATOM_DELETED: u8 = 2;
const ATOM_COUNTER: u8 = 3;
const ATOM_RANGE: u8 = 4;

/// One element of a row's serialized stream: a cell or a range tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    Cell(Cell),
    Range(RangeTombstone),
}

impl Atom {
    /// Ordering key of this atom within the stream.
    pub fn name(&self) -> &[u8] {
        match self {
            Atom::Cell(cell) => cell.name(),
            Atom::Range(rt) => &rt.start,
        }
    }

    /// Exact on-disk size.
    pub fn serialized_size(&self) -> u64 {
        match self {
            Atom::Cell(cell) => cell.serialized_size(),
            Atom::Range(rt) => rt.serialized_size(),
        }
    }
}

impl Encode for Atom {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Atom::Cell(Cell::Live {
                name,
                value,
                timestamp,
            }) => {
                ATOM_LIVE.encode_to(buf)?;
                name.encode_to(buf)?;
                value.encode_to(buf)?;
                timestamp.encode_to(buf)
            }
            Atom::Cell(Cell::Expiring {
                name,
                value,
                timestamp,
                ttl,
                local_deletion_time,
            }) => {
                ATOM_EXPIRING.encode_to(buf)?;
                name.encode_to(buf)?;
                value.encode_to(buf)?;
                timestamp.encode_to(buf)?;
                ttl.encode_to(buf)?;
                local_deletion_time.encode_to(buf)
            }
            Atom::Cell(Cell::Deleted {
                name,
                timestamp,
                local_deletion_time,
            }) => {
                ATOM_DELETED.encode_to(buf)?;
                name.encode_to(buf)?;
                timestamp.encode_to(buf)?;
                local_deletion_time.encode_to(buf)
            }
            Atom::Cell(Cell::Counter {
                name,
                shards,
                timestamp,
            }) => {
                ATOM_COUNTER.encode_to(buf)?;
                name.encode_to(buf)?;
                encoding::encode_seq(shards, buf)?;
                timestamp.encode_to(buf)
            }
            Atom::Range(rt) => {
                ATOM_RANGE.encode_to(buf)?;
                rt.start.encode_to(buf)?;
                rt.end.encode_to(buf)?;
                rt.timestamp.encode_to(buf)?;
                rt.local_deletion_time.encode_to(buf)
            }
        }
    }
}

impl Decode for Atom {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut off) = u8::decode_from(buf)?;
        macro_rules! field {
            ($ty:ty) => {{
                let (value, n) = <$ty>::decode_from(&buf[off..])?;
                off += n;
                value
            }};
        }
        let atom = match tag {
            ATOM_LIVE => Atom::Cell(Cell::Live {
                name: field!(Vec<u8>),
                value: field!(Vec<u8>),
                timestamp: field!(i64),
            }),
            ATOM_EXPIRING => Atom::Cell(Cell::Expiring {
                name: field!(Vec<u8>),
                value: field!(Vec<u8>),
                timestamp: field!(i64),
                ttl: field!(i32),
                local_deletion_time: field!(i32),
            }),
            ATOM_DELETED => Atom::Cell(Cell::Deleted {
                name: field!(Vec<u8>),
                timestamp: field!(i64),
                local_deletion_time: field!(i32),
            }),
            ATOM_COUNTER => {
                let name = field!(Vec<u8>);
                let (shards, n) = encoding::decode_seq::<CounterShard>(&buf[off..])?;
                off += n;
                let timestamp = field!(i64);
                Atom::Cell(Cell::Counter {
                    name,
                    shards,
                    timestamp,
                })
            }
            ATOM_RANGE => Atom::Range(RangeTombstone {
                start: field!(Vec<u8>),
                end: field!(Vec<u8>),
                timestamp: field!(i64),
                local_deletion_time: field!(i32),
            }),
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "Atom",
                })
            }
        };
        Ok((atom, off))
    }
}

// ------------------------------------------------------------------------------------------------
// Column stats
// ------------------------------------------------------------------------------------------------

/// Per-row statistics fed into the table metadata collector.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    /// Number of cells written for the row.
    pub column_count: u64,
    /// Smallest write timestamp observed.
    pub min_timestamp: i64,
    /// Largest write timestamp observed.
    pub max_timestamp: i64,
    /// Drop times of every tombstone in the row.
    pub tombstone_histogram: StreamingHistogram,
}

// ------------------------------------------------------------------------------------------------
// Rows
// ------------------------------------------------------------------------------------------------

/// The outcome of reconciling one incoming cell into a row.
pub struct CellAddOutcome {
    /// Serialized-size delta produced by the write.
    pub size_delta: i64,
    /// The previously stored cell, if the incoming cell replaced it.
    pub replaced: Option<Cell>,
}

/// The comparator-ordered cell set and deletion info of one partition,
/// without the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    /// Row-level deletion state.
    pub deletion: DeletionInfo,
    // cells sorted by the clustering comparator, unique names
    cells: Vec<Cell>,
}

impl RowData {
    /// An empty, live row.
    pub fn empty() -> Self {
        Self {
            deletion: DeletionInfo::live(),
            cells: Vec::new(),
        }
    }

    /// Builds a row from unordered parts, sorting and reconciling.
    pub fn from_parts(
        comparator: &ClusteringComparator,
        deletion: DeletionInfo,
        cells: impl IntoIterator<Item = Cell>,
    ) -> Self {
        let mut row = Self {
            deletion,
            cells: Vec::new(),
        };
        for cell in cells {
            row.add_cell(comparator, cell);
        }
        row
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// True when the row holds no cells (it may still carry deletions).
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cell with the given name, if present.
    pub fn get(&self, comparator: &ClusteringComparator, name: &[u8]) -> Option<&Cell> {
        self.cells
            .binary_search_by(|c| comparator.cmp(c.name(), name))
            .ok()
            .map(|i| &self.cells[i])
    }

    /// Cells in clustering order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Reconciles one cell into the row.
    pub fn add_cell(&mut self, comparator: &ClusteringComparator, cell: Cell) -> CellAddOutcome {
        match self
            .cells
            .binary_search_by(|c| comparator.cmp(c.name(), cell.name()))
        {
            Ok(i) => {
                let existing = self.cells[i].clone();
                let winner = existing.clone().reconcile(cell);
                if winner == existing {
                    CellAddOutcome {
                        size_delta: 0,
                        replaced: None,
                    }
                } else {
                    let delta =
                        winner.serialized_size() as i64 - existing.serialized_size() as i64;
                    self.cells[i] = winner;
                    CellAddOutcome {
                        size_delta: delta,
                        replaced: Some(existing),
                    }
                }
            }
            Err(i) => {
                let delta = cell.serialized_size() as i64;
                self.cells.insert(i, cell);
                CellAddOutcome {
                    size_delta: delta,
                    replaced: None,
                }
            }
        }
    }

    /// Applies another row's deletion info to this one.
    pub fn delete(&mut self, comparator: &ClusteringComparator, other: &DeletionInfo) {
        self.deletion.merge(comparator, other);
    }

    /// Greatest timestamp in the row: cells and deletions.
    pub fn max_timestamp(&self) -> i64 {
        self.cells
            .iter()
            .map(Cell::timestamp)
            .fold(self.deletion.max_timestamp(), i64::max)
    }

    /// True if the row holds tombstones (cell, range or row level) that a
    /// purge at `gc_before` could drop.
    pub fn has_irrelevant_data(&self, gc_before: i32) -> bool {
        if !self.deletion.top.is_live() && self.deletion.top.local_deletion_time < gc_before {
            return true;
        }
        if self
            .deletion
            .ranges
            .iter()
            .any(|rt| rt.local_deletion_time < gc_before)
        {
            return true;
        }
        self.cells
            .iter()
            .any(|c| c.local_deletion_time() < gc_before)
    }

    /// Removes shadowed cells, and — for a real `gc_before` — purges
    /// tombstones past their grace period.
    ///
    /// With `gc_before == i32::MIN` this is the write-path form: cells
    /// shadowed by the row deletion or a covering range tombstone are
    /// dropped, but every tombstone survives.
    pub fn remove_deleted(&mut self, comparator: &ClusteringComparator, gc_before: i32) {
        let deletion = self.deletion.clone();
        self.cells.retain(|cell| {
            if deletion.is_deleted(comparator, cell) {
                return false;
            }
            cell.local_deletion_time() >= gc_before
        });
        self.deletion.purge(gc_before);
    }

    /// Drops counter shards older than `merge_shard_before`. Only called
    /// on purging compactions of commutative stores.
    pub fn remove_old_shards(&mut self, merge_shard_before: i64) {
        for cell in &mut self.cells {
            if let Cell::Counter { shards, .. } = cell {
                if shards.len() > 1 {
                    shards.retain(|s| (s.clock as i64) >= merge_shard_before);
                }
            }
        }
    }

    /// Cells within `[start, end]` (empty bound = unbounded), in forward
    /// or reverse clustering order.
    pub fn slice<'a>(
        &'a self,
        comparator: &'a ClusteringComparator,
        start: &'a [u8],
        end: &'a [u8],
        reversed: bool,
    ) -> impl Iterator<Item = &'a Cell> + 'a {
        let selected: Vec<&'a Cell> = self
            .cells
            .iter()
            .filter(move |c| {
                (start.is_empty() || comparator.cmp(c.name(), start) != Ordering::Less)
                    && (end.is_empty() || comparator.cmp(c.name(), end) != Ordering::Greater)
            })
            .collect();
        let iter: Box<dyn Iterator<Item = &'a Cell> + 'a> = if reversed {
            Box::new(selected.into_iter().rev())
        } else {
            Box::new(selected.into_iter())
        };
        iter
    }

    /// Serialized size of the row body: deletion time, atom count, and
    /// every atom (cells plus range tombstones).
    pub fn serialized_size(&self) -> u64 {
        let atoms: u64 = self
            .cells
            .iter()
            .map(Cell::serialized_size)
            .chain(self.deletion.ranges.iter().map(RangeTombstone::serialized_size))
            .sum();
        12 + 4 + atoms
    }

    /// The atom stream for this row in clustering order: range tombstones
    /// interleaved with cells by start name.
    pub fn atoms(&self, comparator: &ClusteringComparator) -> Vec<Atom> {
        let mut atoms: Vec<Atom> = Vec::with_capacity(self.cells.len() + self.deletion.ranges.len());
        let mut ranges = self.deletion.ranges.iter().peekable();
        for cell in &self.cells {
            while ranges
                .peek()
                .is_some_and(|rt| comparator.cmp(&rt.start, cell.name()) != Ordering::Greater)
            {
                if let Some(rt) = ranges.next() {
                    atoms.push(Atom::Range(rt.clone()));
                }
            }
            atoms.push(Atom::Cell(cell.clone()));
        }
        for rt in ranges {
            atoms.push(Atom::Range(rt.clone()));
        }
        atoms
    }

    /// Statistics for the table metadata collector.
    pub fn column_stats(&self) -> ColumnStats {
        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        let mut histogram = StreamingHistogram::default_tombstone_drop_time();

        if !self.deletion.top.is_live() {
            min_timestamp = min_timestamp.min(self.deletion.top.marked_for_delete_at);
            max_timestamp = max_timestamp.max(self.deletion.top.marked_for_delete_at);
            histogram.update(self.deletion.top.local_deletion_time as f64);
        }
        for rt in &self.deletion.ranges {
            min_timestamp = min_timestamp.min(rt.timestamp);
            max_timestamp = max_timestamp.max(rt.timestamp);
            histogram.update(rt.local_deletion_time as f64);
        }
        for cell in &self.cells {
            min_timestamp = min_timestamp.min(cell.timestamp());
            max_timestamp = max_timestamp.max(cell.timestamp());
            if cell.local_deletion_time() != i32::MAX {
                histogram.update(cell.local_deletion_time() as f64);
            }
        }

        ColumnStats {
            column_count: self.cells.len() as u64,
            min_timestamp,
            max_timestamp,
            tombstone_histogram: histogram,
        }
    }

    /// Digest over `deletion ∥ column count ∥ per-cell digests`, in
    /// clustering order. Used by read repair and validation.
    pub fn update_digest(&self, hasher: &mut Sha256) {
        hasher.update(self.deletion.top.marked_for_delete_at.to_le_bytes());
        hasher.update(self.deletion.top.local_deletion_time.to_le_bytes());
        for rt in &self.deletion.ranges {
            hasher.update(&rt.start);
            hasher.update(&rt.end);
            hasher.update(rt.timestamp.to_le_bytes());
        }
        hasher.update((self.cells.len() as u32).to_le_bytes());
        for cell in &self.cells {
            cell.update_digest(hasher);
        }
    }

    /// Approximate heap footprint, used by the live-ratio metering task.
    pub fn heap_size(&self) -> u64 {
        let mut size = std::mem::size_of::<RowData>() as u64;
        for cell in &self.cells {
            size += std::mem::size_of::<Cell>() as u64
                + cell.name().len() as u64
                + cell.value().len() as u64;
        }
        for rt in &self.deletion.ranges {
            size += std::mem::size_of::<RangeTombstone>() as u64
                + rt.start.len() as u64
                + rt.end.len() as u64;
        }
        size
    }
}

/// A keyed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// The partition this row belongs to.
    pub key: DecoratedKey,
    /// Cells and deletion info.
    pub data: RowData,
}

// ------------------------------------------------------------------------------------------------
// Query filters
// ------------------------------------------------------------------------------------------------

/// Selects cells within one partition.
#[derive(Debug, Clone)]
pub enum QueryFilter {
    /// A sorted set of exact cell names.
    Names(Vec<Vec<u8>>),
    /// A clustering-name slice; empty bounds are unbounded.
    Slice {
        start: Vec<u8>,
        end: Vec<u8>,
        reversed: bool,
    },
}

impl QueryFilter {
    /// The identity filter: every cell, forward order.
    pub fn all() -> Self {
        QueryFilter::Slice {
            start: Vec::new(),
            end: Vec::new(),
            reversed: false,
        }
    }

    /// A names filter, sorting the names under `comparator`.
    pub fn names(comparator: &ClusteringComparator, mut names: Vec<Vec<u8>>) -> Self {
        names.sort_by(|a, b| comparator.cmp(a, b));
        QueryFilter::Names(names)
    }

    /// True if `cell` passes the filter.
    pub fn selects(&self, comparator: &ClusteringComparator, cell: &Cell) -> bool {
        match self {
            QueryFilter::Names(names) => names
                .binary_search_by(|n| comparator.cmp(n, cell.name()))
                .is_ok(),
            QueryFilter::Slice { start, end, .. } => {
                (start.is_empty() || comparator.cmp(cell.name(), start) != Ordering::Less)
                    && (end.is_empty() || comparator.cmp(cell.name(), end) != Ordering::Greater)
            }
        }
    }
}

/// Shared handle to a partitioner, the form every component stores.
pub type PartitionerRef = Arc<dyn Partitioner>;
