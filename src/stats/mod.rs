//! Statistics primitives persisted with every sorted table.
//!
//! Three types live here:
//!
//! - [`EstimatedHistogram`] — fixed-bucket exponential histogram used for
//!   the estimated row size and column count distributions.
//! - [`StreamingHistogram`] — bin-compressing histogram of tombstone drop
//!   times, queryable with [`StreamingHistogram::sum`] to estimate how many
//!   tombstones are droppable at a given `gc_before`.
//! - [`ReplayPosition`] — the monotone commit-log coordinate recorded with
//!   each flushed table so recovery knows how far the log must be replayed.
//!
//! All three serialize through the crate [`encoding`](crate::encoding)
//! layer and are byte-stable.


use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// EstimatedHistogram
// ------------------------------------------------------------------------------------------------

/// Number of buckets sized to track column counts past 2 billion.
pub const COLUMN_COUNT_BUCKETS: usize = 114;

/// Number of buckets sized to track row sizes past 1.5 PB.
pub const ROW_SIZE_BUCKETS: usize = 150;

/// A histogram with exponentially growing fixed bucket offsets.
///
/// Bucket `i` counts values in `(offset[i-1], offset[i]]`; the final
/// bucket is an overflow counter for values beyond the last offset.
/// Offsets grow by a factor of roughly 1.2, matching the distribution
/// tracked by the original row-size and column-count estimators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatedHistogram {
    offsets: Vec<i64>,
    buckets: Vec<u64>,
}

impl EstimatedHistogram {
    /// Creates a histogram with `size` offsets (and `size + 1` buckets).
    pub fn new(size: usize) -> Self {
        let mut offsets = Vec::with_capacity(size);
        let mut last = 1i64;
        offsets.push(last);
        for _ in 1..size {
            let mut next = (last as f64 * 1.2) as i64;
            if next == last {
                next += 1;
            }
            offsets.push(next);
            last = next;
        }
        Self {
            buckets: vec![0; offsets.len() + 1],
            offsets,
        }
    }

    /// Histogram sized for per-row column counts.
    pub fn default_column_count() -> Self {
        Self::new(COLUMN_COUNT_BUCKETS)
    }

    /// Histogram sized for serialized row sizes.
    pub fn default_row_size() -> Self {
        Self::new(ROW_SIZE_BUCKETS)
    }

    /// Records one occurrence of `value`.
    pub fn add(&mut self, value: i64) {
        let index = match self.offsets.binary_search(&value) {
            Ok(i) => i,
            Err(i) => i,
        };
        self.buckets[index] += 1;
    }

    /// Total number of recorded values.
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Mean of the recorded values, rounded up. Overflowed values are
    /// counted at the largest tracked offset. Returns 0 for an empty
    /// histogram.
    pub fn mean(&self) -> i64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let mut total = 0i128;
        for (i, &bucket) in self.buckets.iter().enumerate() {
            let offset = if i < self.offsets.len() {
                self.offsets[i]
            } else {
                self.offsets[self.offsets.len() - 1]
            };
            total += offset as i128 * bucket as i128;
        }
        ((total + count as i128 - 1) / count as i128) as i64
    }

    /// Largest offset with a non-zero bucket, or 0 when empty. Overflow
    /// counts report the last tracked offset.
    pub fn max(&self) -> i64 {
        for (i, &bucket) in self.buckets.iter().enumerate().rev() {
            if bucket > 0 {
                let index = i.min(self.offsets.len() - 1);
                return self.offsets[index];
            }
        }
        0
    }

    /// True if any value landed in the overflow bucket.
    pub fn is_overflowed(&self) -> bool {
        self.buckets[self.buckets.len() - 1] > 0
    }
}

impl Encode for EstimatedHistogram {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_seq(&self.offsets, buf)?;
        encoding::encode_seq(&self.buckets, buf)
    }
}

impl Decode for EstimatedHistogram {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (offsets, mut off) = encoding::decode_seq::<i64>(buf)?;
        let (buckets, n) = encoding::decode_seq::<u64>(&buf[off..])?;
        off += n;
        Ok((Self { offsets, buckets }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// StreamingHistogram
// ------------------------------------------------------------------------------------------------

/// Default bin budget for the tombstone drop-time histogram.
pub const TOMBSTONE_HISTOGRAM_BIN_COUNT: usize = 100;

/// An approximate histogram over a stream of values with a bounded number
/// of bins.
///
/// When an update would exceed the bin budget, the two closest bins are
/// merged into their weighted centroid, so the histogram compresses itself
/// as the value range widens.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingHistogram {
    max_bins: usize,
    // (centroid, count), sorted by centroid
    bins: Vec<(f64, u64)>,
}

impl StreamingHistogram {
    /// Creates an empty histogram with the given bin budget.
    pub fn new(max_bins: usize) -> Self {
        Self {
            max_bins,
            bins: Vec::new(),
        }
    }

    /// Histogram sized for tombstone drop times.
    pub fn default_tombstone_drop_time() -> Self {
        Self::new(TOMBSTONE_HISTOGRAM_BIN_COUNT)
    }

    /// Records one occurrence of `value`.
    pub fn update(&mut self, value: f64) {
        self.update_count(value, 1);
    }

    /// Records `count` occurrences of `value`.
    pub fn update_count(&mut self, value: f64, count: u64) {
        match self
            .bins
            .binary_search_by(|(point, _)| point.partial_cmp(&value).unwrap_or(std::cmp::Ordering::Less))
        {
            Ok(i) => self.bins[i].1 += count,
            Err(i) => {
                self.bins.insert(i, (value, count));
                self.compress();
            }
        }
    }

    /// Merges another histogram into this one.
    pub fn merge(&mut self, other: &StreamingHistogram) {
        for &(point, count) in &other.bins {
            self.update_count(point, count);
        }
    }

    /// Estimates the number of recorded values that are `<= upto`, using
    /// linear interpolation within the straddling bin pair.
    pub fn sum(&self, upto: f64) -> f64 {
        let next = self.bins.iter().position(|&(point, _)| point > upto);
        match next {
            // everything recorded is at or below `upto`
            None => self.bins.iter().map(|&(_, count)| count as f64).sum(),
            Some(0) => 0.0,
            Some(next) => {
                let (p_i, m_i) = self.bins[next - 1];
                let (p_next, m_next) = self.bins[next];
                let weight = (upto - p_i) / (p_next - p_i);
                let m_b = m_i as f64 + (m_next as f64 - m_i as f64) * weight;
                let mut sum = (m_i as f64 + m_b) / 2.0 * weight;
                sum += m_i as f64 / 2.0;
                for &(_, count) in &self.bins[..next - 1] {
                    sum += count as f64;
                }
                sum
            }
        }
    }

    /// Number of bins currently held.
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    fn compress(&mut self) {
        while self.bins.len() > self.max_bins {
            let mut closest = 1;
            let mut smallest = f64::MAX;
            for i in 1..self.bins.len() {
                let delta = self.bins[i].0 - self.bins[i - 1].0;
                if delta < smallest {
                    smallest = delta;
                    closest = i;
                }
            }
            let (p1, m1) = self.bins[closest - 1];
            let (p2, m2) = self.bins[closest];
            let merged_count = m1 + m2;
            let centroid = (p1 * m1 as f64 + p2 * m2 as f64) / merged_count as f64;
            self.bins[closest - 1] = (centroid, merged_count);
            self.bins.remove(closest);
        }
    }
}

impl Encode for StreamingHistogram {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.max_bins as u32).encode_to(buf)?;
        encoding::encode_seq(&self.bins, buf)
    }
}

impl Decode for StreamingHistogram {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (max_bins, mut off) = u32::decode_from(buf)?;
        let (bins, n) = encoding::decode_seq::<(f64, u64)>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                max_bins: max_bins as usize,
                bins,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// ReplayPosition
// ------------------------------------------------------------------------------------------------

/// A monotone commit-log coordinate: `(segment, position)`.
///
/// Recorded with each flushed table; the commit log below a signalled
/// position is guaranteed fully persisted in sorted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplayPosition {
    /// Commit-log segment identifier.
    pub segment: i64,
    /// Byte offset within the segment.
    pub position: u32,
}

impl ReplayPosition {
    /// Sentinel for tables not produced from a commit-log-backed flush
    /// (compaction outputs, streamed tables).
    pub const NONE: ReplayPosition = ReplayPosition {
        segment: -1,
        position: 0,
    };

    /// True if this is the [`ReplayPosition::NONE`] sentinel.
    pub fn is_none(&self) -> bool {
        self.segment < 0
    }
}

impl Encode for ReplayPosition {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.segment.encode_to(buf)?;
        self.position.encode_to(buf)
    }
}

impl Decode for ReplayPosition {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (segment, mut off) = i64::decode_from(buf)?;
        let (position, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { segment, position }, off))
    }
}
