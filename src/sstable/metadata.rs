//! Statistics sidecar for sorted tables.
//!
//! Every table carries a `Statistics` component with the estimated row
//! size and column count histograms, the tombstone drop-time histogram,
//! the replay position the table covers, min/max cell timestamps, the
//! compression ratio, the partitioner identity, and the generations of
//! the tables it was compacted from.
//!
//! The serialized layout is fixed:
//!
//! ```text
//! estimatedRowSize ∥ estimatedColumnCount ∥ [replayPosition]
//!   ∥ [minTimestamp] ∥ [maxTimestamp] ∥ [compressionRatio:f64]
//!   ∥ [partitioner:string] ∥ [ancestorCount:u32 ∥ ancestors:u32…]
//!   ∥ [tombstoneHistogram]
//! ```
//!
//! Each bracketed field is present iff the table's format
//! [`Version`](super::Version) advertises it; missing fields decode to
//! the sentinel the read path expects.

use std::collections::BTreeSet;

use crate::encoding::{Decode, Encode, EncodingError};
use crate::stats::{EstimatedHistogram, ReplayPosition, StreamingHistogram};

use super::Version;

/// Sentinel compression ratio meaning "unknown / not compressed".
pub const NO_COMPRESSION_RATIO: f64 = -1.0;

/// The durable per-table statistics.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Distribution of serialized row sizes.
    pub estimated_row_size: EstimatedHistogram,
    /// Distribution of per-row column counts.
    pub estimated_column_count: EstimatedHistogram,
    /// Commit-log position this table's flush covered;
    /// [`ReplayPosition::NONE`] for compaction outputs.
    pub replay_position: ReplayPosition,
    /// Smallest cell timestamp in the table (`i64::MIN` when untracked).
    pub min_timestamp: i64,
    /// Largest cell timestamp in the table (`i64::MAX` when untracked).
    pub max_timestamp: i64,
    /// `compressed / uncompressed`, or [`NO_COMPRESSION_RATIO`].
    pub compression_ratio: f64,
    /// Partitioner identity, asserted when the table is opened.
    pub partitioner: String,
    /// Generations merged into this table.
    pub ancestors: BTreeSet<u64>,
    /// Drop times of every tombstone written.
    pub estimated_tombstone_drop_time: StreamingHistogram,
}

impl TableMetadata {
    /// Estimated ratio of droppable tombstones to columns at `gc_before`.
    /// Returns 0 when the column estimate is empty.
    pub fn droppable_tombstone_ratio(&self, gc_before: i32) -> f64 {
        let columns =
            self.estimated_column_count.mean() as i128 * self.estimated_column_count.count() as i128;
        if columns <= 0 {
            return 0.0;
        }
        self.estimated_tombstone_drop_time.sum(gc_before as f64) / columns as f64
    }

    /// Serializes under the field gates of `version`.
    pub fn serialize(&self, version: Version) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        self.estimated_row_size.encode_to(&mut buf)?;
        self.estimated_column_count.encode_to(&mut buf)?;
        if version.has_replay_position() {
            self.replay_position.encode_to(&mut buf)?;
        }
        if version.tracks_min_timestamp() {
            self.min_timestamp.encode_to(&mut buf)?;
        }
        if version.tracks_max_timestamp() {
            self.max_timestamp.encode_to(&mut buf)?;
        }
        if version.has_compression_ratio() {
            self.compression_ratio.encode_to(&mut buf)?;
        }
        if version.has_partitioner() {
            self.partitioner.encode_to(&mut buf)?;
        }
        if version.has_ancestors() {
            (self.ancestors.len() as u32).encode_to(&mut buf)?;
            for &generation in &self.ancestors {
                (generation as u32).encode_to(&mut buf)?;
            }
        }
        if version.tracks_tombstones() {
            self.estimated_tombstone_drop_time.encode_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Deserializes under the field gates of `version`; absent fields
    /// take their sentinel values.
    pub fn deserialize(buf: &[u8], version: Version) -> Result<Self, EncodingError> {
        let mut off = 0;
        macro_rules! field {
            ($ty:ty) => {{
                let (value, n) = <$ty>::decode_from(&buf[off..])?;
                off += n;
                value
            }};
        }

        let estimated_row_size = field!(EstimatedHistogram);
        let estimated_column_count = field!(EstimatedHistogram);
        let replay_position = if version.has_replay_position() {
            field!(ReplayPosition)
        } else {
            ReplayPosition::NONE
        };
        let min_timestamp = if version.tracks_min_timestamp() {
            field!(i64)
        } else {
            i64::MIN
        };
        let max_timestamp = if version.tracks_max_timestamp() {
            field!(i64)
        } else {
            i64::MAX
        };
        let compression_ratio = if version.has_compression_ratio() {
            field!(f64)
        } else {
            NO_COMPRESSION_RATIO
        };
        let partitioner = if version.has_partitioner() {
            field!(String)
        } else {
            String::new()
        };
        let mut ancestors = BTreeSet::new();
        if version.has_ancestors() {
            let count = field!(u32);
            for _ in 0..count {
                ancestors.insert(field!(u32) as u64);
            }
        }
        let estimated_tombstone_drop_time = if version.tracks_tombstones() {
            field!(StreamingHistogram)
        } else {
            StreamingHistogram::default_tombstone_drop_time()
        };

        Ok(Self {
            estimated_row_size,
            estimated_column_count,
            replay_position,
            min_timestamp,
            max_timestamp,
            compression_ratio,
            partitioner,
            ancestors,
            estimated_tombstone_drop_time,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Collector
// ------------------------------------------------------------------------------------------------

/// Accumulates per-row statistics while a table is written.
pub struct MetadataCollector {
    estimated_row_size: EstimatedHistogram,
    estimated_column_count: EstimatedHistogram,
    replay_position: ReplayPosition,
    min_timestamp: i64,
    max_timestamp: i64,
    compression_ratio: f64,
    ancestors: BTreeSet<u64>,
    tombstone_histogram: StreamingHistogram,
}

impl MetadataCollector {
    /// A collector with empty histograms and sentinel timestamps.
    pub fn new() -> Self {
        Self {
            estimated_row_size: EstimatedHistogram::default_row_size(),
            estimated_column_count: EstimatedHistogram::default_column_count(),
            replay_position: ReplayPosition::NONE,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            compression_ratio: NO_COMPRESSION_RATIO,
            ancestors: BTreeSet::new(),
            tombstone_histogram: StreamingHistogram::default_tombstone_drop_time(),
        }
    }

    /// Records the replay position covered by this table.
    pub fn replay_position(mut self, position: ReplayPosition) -> Self {
        self.replay_position = position;
        self
    }

    /// Records an input generation merged into this table.
    pub fn add_ancestor(&mut self, generation: u64) {
        self.ancestors.insert(generation);
    }

    /// Folds one written row into the histograms.
    pub fn update(&mut self, row_size: u64, stats: &crate::row::ColumnStats) {
        self.estimated_row_size.add(row_size as i64);
        self.estimated_column_count.add(stats.column_count as i64);
        if stats.min_timestamp != i64::MAX {
            self.min_timestamp = self.min_timestamp.min(stats.min_timestamp);
        }
        if stats.max_timestamp != i64::MIN {
            self.max_timestamp = self.max_timestamp.max(stats.max_timestamp);
        }
        self.tombstone_histogram.merge(&stats.tombstone_histogram);
    }

    /// Finishes collection, naming the partitioner the table was written
    /// under.
    pub fn finalize(self, partitioner: &str) -> TableMetadata {
        TableMetadata {
            estimated_row_size: self.estimated_row_size,
            estimated_column_count: self.estimated_column_count,
            replay_position: self.replay_position,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            compression_ratio: self.compression_ratio,
            partitioner: partitioner.to_string(),
            ancestors: self.ancestors,
            estimated_tombstone_drop_time: self.tombstone_histogram,
        }
    }
}

impl Default for MetadataCollector {
    fn default() -> Self {
        Self::new()
    }
}
