//! # Sorted tables
//!
//! An immutable, partition-key-sorted on-disk table. Each table is a file
//! set identified by a [`Descriptor`]:
//!
//! | Component    | Contents                                             |
//! |--------------|------------------------------------------------------|
//! | `Data`       | rows in `(token, key)` order                         |
//! | `Index`      | key → (data offset, promoted row-index offset)       |
//! | `Summary`    | sparse sample of the index plus first/last keys      |
//! | `Filter`     | bloom filter over partition keys                     |
//! | `Statistics` | the [`metadata::TableMetadata`] sidecar              |
//! | `TOC`        | the component list — written last, the commit point  |
//!
//! ## Row layout
//!
//! ```text
//! [u16 key_len][key][u64 row_len][deletion_time:12][u32 atom_count]
//! [atoms…][promoted row index?]
//! ```
//!
//! `row_len` covers everything after itself, so a scanner can skip a row
//! without decoding it. Rows whose atom payload exceeds the column-index
//! block size carry a promoted row index — a list of [`IndexInfo`] block
//! descriptors — appended after the atoms; its absolute offset is
//! recorded in the `Index` entry so named reads can seek straight to the
//! covering block.
//!
//! ## Failure semantics
//!
//! The writer is abortable: until the TOC is written no reader will open
//! the set, and [`writer::SSTableWriter::abort`] removes every file
//! produced. Readers surface decode failures as
//! [`SSTableError::Corrupt`]; marking the table suspect is a side effect
//! at the store layer, never an unwind.

// pub(crate): other modules' tests borrow the table builders in here
#[cfg(test)]
pub(crate) mod tests;

pub mod metadata;
pub mod writer;

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bloomfilter::Bloom;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::row::{
    Atom, Cell, ClusteringComparator, DecoratedKey, DeletionTime, PartitionerRef, QueryFilter,
    RangeTombstone, Token,
};
use crate::tracker::KeyCache;

pub use metadata::{MetadataCollector, TableMetadata, NO_COMPRESSION_RATIO};
pub use writer::SSTableWriter;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by sorted-table reads and writes.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Wire-format error while encoding or decoding a component.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The table's bytes are not what the format promises: bad magic,
    /// CRC mismatch, truncated block, or an impossible offset.
    #[error("corrupt sstable {descriptor}: {detail}")]
    Corrupt {
        descriptor: String,
        detail: String,
    },

    /// The statistics sidecar names a different partitioner.
    #[error("sstable {descriptor} written by partitioner {actual}, store uses {expected}")]
    UnknownPartitioner {
        descriptor: String,
        expected: String,
        actual: String,
    },

    /// The TOC is missing or lists components that do not exist.
    #[error("incomplete sstable {descriptor}: missing {missing}")]
    IncompleteSet {
        descriptor: String,
        missing: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SSTableError {
    fn corrupt(descriptor: &Descriptor, detail: impl Into<String>) -> Self {
        SSTableError::Corrupt {
            descriptor: descriptor.to_string(),
            detail: detail.into(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Components, versions, descriptors
// ------------------------------------------------------------------------------------------------

/// One file of a table's component set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Data,
    Index,
    Summary,
    Filter,
    Statistics,
    Toc,
}

impl Component {
    /// Every component of a complete table, TOC last.
    pub const ALL: [Component; 6] = [
        Component::Data,
        Component::Index,
        Component::Summary,
        Component::Filter,
        Component::Statistics,
        Component::Toc,
    ];

    /// The name recorded in the TOC and used in filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Data => "Data",
            Component::Index => "Index",
            Component::Summary => "Summary",
            Component::Filter => "Filter",
            Component::Statistics => "Statistics",
            Component::Toc => "TOC",
        }
    }

    fn from_str(name: &str) -> Option<Component> {
        Component::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// On-disk format version. Fields of the statistics sidecar are gated on
/// the flags below; older versions decode missing fields to sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    id: [u8; 2],
}

impl Version {
    /// The current format.
    pub const CURRENT: Version = Version { id: *b"sb" };
    /// The previous format, which did not track the tombstone histogram.
    pub const LEGACY: Version = Version { id: *b"sa" };

    /// Parses a two-letter version identifier.
    pub fn parse(id: &str) -> Option<Version> {
        match id.as_bytes() {
            b"sa" => Some(Version::LEGACY),
            b"sb" => Some(Version::CURRENT),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.id).unwrap_or("??")
    }

    pub fn has_replay_position(&self) -> bool {
        true
    }

    pub fn tracks_min_timestamp(&self) -> bool {
        true
    }

    pub fn tracks_max_timestamp(&self) -> bool {
        true
    }

    pub fn has_compression_ratio(&self) -> bool {
        true
    }

    pub fn has_partitioner(&self) -> bool {
        true
    }

    pub fn has_ancestors(&self) -> bool {
        true
    }

    pub fn tracks_tombstones(&self) -> bool {
        self.id >= *b"sb"
    }
}

/// Identity of one table: where it lives and which generation it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Directory holding the component files.
    pub directory: PathBuf,
    /// Keyspace the owning store belongs to.
    pub keyspace: String,
    /// Column-family (store) name.
    pub cf: String,
    /// Per-store monotone generation number.
    pub generation: u64,
    /// On-disk format version.
    pub version: Version,
}

impl Descriptor {
    /// Creates a descriptor for the current format version.
    pub fn new(
        directory: impl Into<PathBuf>,
        keyspace: impl Into<String>,
        cf: impl Into<String>,
        generation: u64,
    ) -> Self {
        Self {
            directory: directory.into(),
            keyspace: keyspace.into(),
            cf: cf.into(),
            generation,
            version: Version::CURRENT,
        }
    }

    /// Path of one component file.
    pub fn path_for(&self, component: Component) -> PathBuf {
        let extension = match component {
            Component::Toc => "txt",
            _ => "db",
        };
        self.directory.join(format!(
            "{}-{}-{}-{}.{}",
            self.cf,
            self.version.as_str(),
            self.generation,
            component.as_str(),
            extension
        ))
    }

    /// Parses `<cf>-<version>-<generation>-<Component>.<ext>` back into a
    /// descriptor, for directory scans during recovery.
    pub fn parse_filename(
        directory: &std::path::Path,
        keyspace: &str,
        filename: &str,
    ) -> Option<(Descriptor, Component)> {
        let stem = filename.strip_suffix(".db").or_else(|| filename.strip_suffix(".txt"))?;
        let mut parts = stem.rsplitn(4, '-');
        let component = Component::from_str(parts.next()?)?;
        let generation: u64 = parts.next()?.parse().ok()?;
        let version = Version::parse(parts.next()?)?;
        let cf = parts.next()?;
        Some((
            Descriptor {
                directory: directory.to_path_buf(),
                keyspace: keyspace.to_string(),
                cf: cf.to_string(),
                generation,
                version,
            },
            component,
        ))
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}-{}-{}",
            self.keyspace,
            self.cf,
            self.version.as_str(),
            self.generation
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Index structures
// ------------------------------------------------------------------------------------------------

/// Where a partition's row begins in the data file, and where its
/// promoted row index sits (0 = not promoted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowIndexEntry {
    pub position: u64,
    pub promoted_offset: u64,
}

/// One block descriptor of a promoted row index: the clustering names it
/// spans and the byte range of its atoms relative to the row's atom
/// region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub first_name: Vec<u8>,
    pub last_name: Vec<u8>,
    pub offset: u64,
    pub width: u64,
}

impl Encode for IndexInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_name.encode_to(buf)?;
        self.last_name.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.width.encode_to(buf)
    }
}

impl Decode for IndexInfo {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (first_name, mut off) = Vec::<u8>::decode_from(buf)?;
        let (last_name, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (width, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                first_name,
                last_name,
                offset,
                width,
            },
            off,
        ))
    }
}

const SUMMARY_MAGIC: [u8; 4] = *b"SBSM";
const FILTER_MAGIC: [u8; 4] = *b"SBFL";

// ------------------------------------------------------------------------------------------------
// TOC
// ------------------------------------------------------------------------------------------------

pub(crate) fn write_toc(descriptor: &Descriptor) -> Result<(), SSTableError> {
    let mut content = String::new();
    for component in Component::ALL {
        content.push_str(component.as_str());
        content.push('\n');
    }
    fs::write(descriptor.path_for(Component::Toc), content)?;
    Ok(())
}

/// Reads the TOC and verifies every listed component exists on disk.
pub fn verify_component_set(descriptor: &Descriptor) -> Result<(), SSTableError> {
    let toc_path = descriptor.path_for(Component::Toc);
    let content = fs::read_to_string(&toc_path).map_err(|_| SSTableError::IncompleteSet {
        descriptor: descriptor.to_string(),
        missing: Component::Toc.as_str().to_string(),
    })?;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let component = Component::from_str(line.trim()).ok_or_else(|| {
            SSTableError::corrupt(descriptor, format!("unknown TOC entry {line:?}"))
        })?;
        if !descriptor.path_for(component).exists() {
            return Err(SSTableError::IncompleteSet {
                descriptor: descriptor.to_string(),
                missing: component.as_str().to_string(),
            });
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

struct SummaryEntry {
    key: Vec<u8>,
    index_offset: u64,
}

/// The cells and tombstones one table holds for a partition.
#[derive(Debug, Clone)]
pub struct RowFragment {
    pub deletion: DeletionTime,
    pub ranges: Vec<RangeTombstone>,
    pub cells: Vec<Cell>,
}

/// A shared, immutable reader over one table's component set.
///
/// Lifetime equals the longest holder among the tracker view,
/// outstanding iterators and cache entries; the last reference drop of a
/// reader that was marked compacted deletes the physical files and
/// evicts the generation's key-cache entries.
pub struct SSTableReader {
    pub descriptor: Descriptor,
    pub metadata: TableMetadata,
    partitioner: PartitionerRef,
    comparator: ClusteringComparator,
    data: Mmap,
    index: Mmap,
    summary: Vec<SummaryEntry>,
    filter: Option<Bloom<[u8]>>,
    first: DecoratedKey,
    last: DecoratedKey,
    key_cache: Option<Arc<KeyCache>>,
    suspect: AtomicBool,
    compacted: AtomicBool,
}

impl SSTableReader {
    /// Opens a table, verifying the component set, the statistics
    /// partitioner, and the summary/filter checksums.
    pub fn open(
        descriptor: Descriptor,
        partitioner: PartitionerRef,
        comparator: ClusteringComparator,
        key_cache: Option<Arc<KeyCache>>,
    ) -> Result<SSTableReader, SSTableError> {
        verify_component_set(&descriptor)?;

        let stats_bytes = fs::read(descriptor.path_for(Component::Statistics))?;
        let metadata = TableMetadata::deserialize(&stats_bytes, descriptor.version)
            .map_err(|e| SSTableError::corrupt(&descriptor, format!("statistics: {e}")))?;
        if !metadata.partitioner.is_empty() && metadata.partitioner != partitioner.name() {
            return Err(SSTableError::UnknownPartitioner {
                descriptor: descriptor.to_string(),
                expected: partitioner.name().to_string(),
                actual: metadata.partitioner.clone(),
            });
        }

        let data_file = File::open(descriptor.path_for(Component::Data))?;
        // read-only map of an immutable file
        let data = unsafe { Mmap::map(&data_file)? };
        let index_file = File::open(descriptor.path_for(Component::Index))?;
        let index = unsafe { Mmap::map(&index_file)? };

        let (summary, first_key, last_key) = Self::load_summary(&descriptor)?;
        let filter = Self::load_filter(&descriptor)?;

        let first = partitioner.decorate(first_key);
        let last = partitioner.decorate(last_key);

        debug!(
            descriptor = %descriptor,
            data_len = data.len(),
            summary_entries = summary.len(),
            "opened sstable"
        );

        Ok(SSTableReader {
            descriptor,
            metadata,
            partitioner,
            comparator,
            data,
            index,
            summary,
            filter,
            first,
            last,
            key_cache,
            suspect: AtomicBool::new(false),
            compacted: AtomicBool::new(false),
        })
    }

    fn load_summary(
        descriptor: &Descriptor,
    ) -> Result<(Vec<SummaryEntry>, Vec<u8>, Vec<u8>), SSTableError> {
        let bytes = fs::read(descriptor.path_for(Component::Summary))?;
        if bytes.len() < 8 {
            return Err(SSTableError::corrupt(descriptor, "summary truncated"));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(body) != stored {
            return Err(SSTableError::corrupt(descriptor, "summary CRC mismatch"));
        }
        if body[..4] != SUMMARY_MAGIC {
            return Err(SSTableError::corrupt(descriptor, "summary bad magic"));
        }
        let mut off = 4;
        macro_rules! field {
            ($ty:ty) => {{
                let (value, n) = <$ty>::decode_from(&body[off..])
                    .map_err(|e| SSTableError::corrupt(descriptor, format!("summary: {e}")))?;
                off += n;
                value
            }};
        }
        let _interval = field!(u32);
        let first_key = field!(Vec<u8>);
        let last_key = field!(Vec<u8>);
        let count = field!(u32);
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = field!(Vec<u8>);
            let index_offset = field!(u64);
            entries.push(SummaryEntry { key, index_offset });
        }
        Ok((entries, first_key, last_key))
    }

    fn load_filter(descriptor: &Descriptor) -> Result<Option<Bloom<[u8]>>, SSTableError> {
        let bytes = fs::read(descriptor.path_for(Component::Filter))?;
        if bytes.len() < 8 {
            return Err(SSTableError::corrupt(descriptor, "filter truncated"));
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        if crc32fast::hash(body) != stored {
            return Err(SSTableError::corrupt(descriptor, "filter CRC mismatch"));
        }
        if body[..4] != FILTER_MAGIC {
            return Err(SSTableError::corrupt(descriptor, "filter bad magic"));
        }
        let (payload, _) = Vec::<u8>::decode_from(&body[4..])
            .map_err(|e| SSTableError::corrupt(descriptor, format!("filter: {e}")))?;
        if payload.is_empty() {
            // bloom disabled at write time: treat as always-present
            return Ok(None);
        }
        match Bloom::from_slice(&payload) {
            Ok(bloom) => Ok(Some(bloom)),
            Err(e) => Err(SSTableError::corrupt(descriptor, format!("filter: {e}"))),
        }
    }

    /// The table's generation number.
    pub fn generation(&self) -> u64 {
        self.descriptor.generation
    }

    /// Size of the Data component in bytes.
    pub fn data_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// First decorated key in the table.
    pub fn first(&self) -> &DecoratedKey {
        &self.first
    }

    /// Last decorated key in the table.
    pub fn last(&self) -> &DecoratedKey {
        &self.last
    }

    /// Token interval covered by this table.
    pub fn token_range(&self) -> (Token, Token) {
        (self.first.token, self.last.token)
    }

    /// Bloom-filter membership for the raw key bytes. A table with a
    /// disabled filter always answers `true`; [`Self::key_is_present`]
    /// falls back to the index in that case.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => filter.check(key),
            None => true,
        }
    }

    /// True when the filter is the always-present fallback.
    pub fn filter_is_always_present(&self) -> bool {
        self.filter.is_none()
    }

    /// Definitive presence check through the index; used by the purge
    /// predicate when the bloom filter cannot answer.
    pub fn key_is_present(&self, key: &DecoratedKey) -> Result<bool, SSTableError> {
        Ok(self.index_entry(key)?.is_some())
    }

    /// Index lookup for a key: key cache, then summary sample, then a
    /// bounded index scan. Hits populate the key cache.
    pub fn index_entry(&self, key: &DecoratedKey) -> Result<Option<RowIndexEntry>, SSTableError> {
        if key < &self.first || key > &self.last {
            return Ok(None);
        }
        if let Some(cache) = &self.key_cache {
            if let Some(entry) = cache.get(self.generation(), &key.key) {
                return Ok(Some(entry));
            }
        }

        // rightmost summary entry at or before the key
        let at = self.summary.partition_point(|entry| {
            self.partitioner.decorate(entry.key.clone()) <= *key
        });
        if at == 0 {
            return Ok(None);
        }
        let mut off = self.summary[at - 1].index_offset as usize;

        while off < self.index.len() {
            let (entry_key, entry, next) = self.decode_index_entry(off)?;
            let decorated = self.partitioner.decorate(entry_key);
            match decorated.cmp(key) {
                std::cmp::Ordering::Less => off = next,
                std::cmp::Ordering::Equal => {
                    if let Some(cache) = &self.key_cache {
                        cache.insert(self.generation(), key.key.clone(), entry);
                    }
                    return Ok(Some(entry));
                }
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    fn decode_index_entry(
        &self,
        off: usize,
    ) -> Result<(Vec<u8>, RowIndexEntry, usize), SSTableError> {
        let buf = &self.index[off..];
        if buf.len() < 2 {
            return Err(SSTableError::corrupt(&self.descriptor, "index truncated"));
        }
        let key_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + key_len + 16 {
            return Err(SSTableError::corrupt(&self.descriptor, "index truncated"));
        }
        let key = buf[2..2 + key_len].to_vec();
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(&buf[2 + key_len..2 + key_len + 8]);
        let position = u64::from_le_bytes(fixed);
        fixed.copy_from_slice(&buf[2 + key_len + 8..2 + key_len + 16]);
        let promoted_offset = u64::from_le_bytes(fixed);
        Ok((
            key,
            RowIndexEntry {
                position,
                promoted_offset,
            },
            off + 2 + key_len + 16,
        ))
    }

    /// Reads the promoted row index at the given absolute offset.
    fn read_promoted(&self, offset: u64) -> Result<Vec<IndexInfo>, SSTableError> {
        let (infos, _) = encoding::decode_seq::<IndexInfo>(&self.data[offset as usize..])
            .map_err(|e| SSTableError::corrupt(&self.descriptor, format!("promoted index: {e}")))?;
        Ok(infos)
    }

    /// Reads the table's fragment of a partition, filtered.
    ///
    /// Named reads against a promoted row consume each covering block at
    /// most once; other shapes stream the atom region.
    pub fn read_row(
        &self,
        key: &DecoratedKey,
        filter: &QueryFilter,
    ) -> Result<Option<RowFragment>, SSTableError> {
        if !self.may_contain(&key.key) {
            return Ok(None);
        }
        let Some(entry) = self.index_entry(key)? else {
            return Ok(None);
        };
        let header = self.row_header_at(entry.position)?;
        if header.key != key.key {
            return Err(SSTableError::corrupt(
                &self.descriptor,
                "index points at a different key",
            ));
        }

        let mut fragment = RowFragment {
            deletion: header.deletion,
            ranges: Vec::new(),
            cells: Vec::new(),
        };

        match filter {
            QueryFilter::Names(names) if entry.promoted_offset != 0 => {
                let blocks = self.read_promoted(entry.promoted_offset)?;
                let mut block_idx = 0usize;
                let mut consumed: Option<usize> = None;
                for name in names {
                    while block_idx < blocks.len()
                        && self
                            .comparator
                            .cmp(&blocks[block_idx].last_name, name)
                            == std::cmp::Ordering::Less
                    {
                        block_idx += 1;
                    }
                    if block_idx >= blocks.len() {
                        break;
                    }
                    let block = &blocks[block_idx];
                    if self.comparator.cmp(&block.first_name, name) == std::cmp::Ordering::Greater {
                        continue;
                    }
                    // scan the block once, even if several names land in it
                    if consumed == Some(block_idx) {
                        continue;
                    }
                    consumed = Some(block_idx);
                    let start = header.atoms_offset + block.offset;
                    let mut cursor = AtomCursor {
                        reader: self,
                        pos: start as usize,
                        end: (start + block.width) as usize,
                        remaining: u32::MAX,
                    };
                    while let Some(atom) = cursor.next_atom()? {
                        match atom {
                            Atom::Cell(cell) => {
                                if names
                                    .binary_search_by(|n| self.comparator.cmp(n, cell.name()))
                                    .is_ok()
                                {
                                    fragment.cells.push(cell);
                                }
                            }
                            Atom::Range(rt) => fragment.ranges.push(rt),
                        }
                    }
                }
            }
            _ => {
                let mut cursor = self.atom_cursor(&header);
                while let Some(atom) = cursor.next_atom()? {
                    match atom {
                        Atom::Cell(cell) => {
                            if filter.selects(&self.comparator, &cell) {
                                fragment.cells.push(cell);
                            }
                        }
                        Atom::Range(rt) => fragment.ranges.push(rt),
                    }
                }
            }
        }

        Ok(Some(fragment))
    }

    fn row_header_at(&self, position: u64) -> Result<RowHeader, SSTableError> {
        let pos = position as usize;
        let buf = &self.data[pos..];
        if buf.len() < 2 {
            return Err(SSTableError::corrupt(&self.descriptor, "row header truncated"));
        }
        let key_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + key_len + 8 + 12 + 4 {
            return Err(SSTableError::corrupt(&self.descriptor, "row header truncated"));
        }
        let key = buf[2..2 + key_len].to_vec();
        let mut off = 2 + key_len;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(&buf[off..off + 8]);
        let row_len = u64::from_le_bytes(fixed);
        off += 8;
        let (deletion, n) = DeletionTime::decode_from(&buf[off..])
            .map_err(|e| SSTableError::corrupt(&self.descriptor, format!("deletion time: {e}")))?;
        off += n;
        let mut fixed4 = [0u8; 4];
        fixed4.copy_from_slice(&buf[off..off + 4]);
        let atom_count = u32::from_le_bytes(fixed4);
        off += 4;

        let row_end = position + 2 + key_len as u64 + 8 + row_len;
        if row_end > self.data.len() as u64 {
            return Err(SSTableError::corrupt(&self.descriptor, "row overruns data file"));
        }
        Ok(RowHeader {
            key,
            row_len,
            deletion,
            atom_count,
            atoms_offset: position + off as u64,
            row_end,
        })
    }

    fn atom_cursor(&self, header: &RowHeader) -> AtomCursor<'_> {
        AtomCursor {
            reader: self,
            pos: header.atoms_offset as usize,
            end: header.row_end as usize,
            remaining: header.atom_count,
        }
    }

    /// A positional scanner over the whole Data component.
    pub fn scanner(reader: &Arc<SSTableReader>) -> SSTableScanner {
        SSTableScanner::new(Arc::clone(reader))
    }

    /// Estimated droppable-tombstone ratio at `gc_before`.
    pub fn droppable_tombstone_ratio(&self, gc_before: i32) -> f64 {
        self.metadata.droppable_tombstone_ratio(gc_before)
    }

    /// Flags the table as corrupt; the tracker drops suspect tables from
    /// the live set and compactions skip them on retry.
    pub fn mark_suspect(&self) {
        warn!(descriptor = %self.descriptor, "marking sstable suspect");
        self.suspect.store(true, AtomicOrdering::SeqCst);
    }

    /// True if a reader observed corruption in this table.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(AtomicOrdering::SeqCst)
    }

    /// Marks the table replaced by a compaction: the physical files are
    /// deleted when the last reference drops.
    pub fn mark_compacted(&self) {
        self.compacted.store(true, AtomicOrdering::SeqCst);
    }

    /// The comparator this table's rows are ordered with.
    pub fn comparator(&self) -> ClusteringComparator {
        self.comparator
    }
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("descriptor", &self.descriptor.to_string())
            .field("data_size", &self.data_size())
            .finish()
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if !self.compacted.load(AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(cache) = &self.key_cache {
            cache.invalidate_generation(self.generation());
        }
        for component in Component::ALL {
            let path = self.descriptor.path_for(component);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(descriptor = %self.descriptor, component = component.as_str(), %e,
                        "failed to delete compacted sstable component");
                }
            }
        }
        debug!(descriptor = %self.descriptor, "deleted compacted sstable");
    }
}

struct RowHeader {
    key: Vec<u8>,
    row_len: u64,
    deletion: DeletionTime,
    atom_count: u32,
    atoms_offset: u64,
    row_end: u64,
}

// ------------------------------------------------------------------------------------------------
// Atom cursors and scanners
// ------------------------------------------------------------------------------------------------

/// Streams atoms from a byte range of the data file.
struct AtomCursor<'a> {
    reader: &'a SSTableReader,
    pos: usize,
    end: usize,
    remaining: u32,
}

impl AtomCursor<'_> {
    fn next_atom(&mut self) -> Result<Option<Atom>, SSTableError> {
        if self.remaining == 0 || self.pos >= self.end {
            return Ok(None);
        }
        let (atom, n) = Atom::decode_from(&self.reader.data[self.pos..self.end]).map_err(|e| {
            SSTableError::corrupt(&self.reader.descriptor, format!("atom decode: {e}"))
        })?;
        self.pos += n;
        self.remaining = self.remaining.saturating_sub(1);
        Ok(Some(atom))
    }
}

/// An owned cursor over one row's atom region, recreatable for
/// multi-pass consumers.
#[derive(Clone)]
pub struct OwnedAtomCursor {
    reader: Arc<SSTableReader>,
    start: u64,
    end: u64,
    atom_count: u32,
    pos: u64,
    remaining: u32,
}

impl OwnedAtomCursor {
    /// Resets the cursor to the start of the atom region.
    pub fn rewind(&mut self) {
        self.pos = self.start;
        self.remaining = self.atom_count;
    }

    /// Decodes the next atom.
    pub fn next_atom(&mut self) -> Result<Option<Atom>, SSTableError> {
        if self.remaining == 0 || self.pos >= self.end {
            return Ok(None);
        }
        let (atom, n) =
            Atom::decode_from(&self.reader.data[self.pos as usize..self.end as usize]).map_err(
                |e| SSTableError::corrupt(&self.reader.descriptor, format!("atom decode: {e}")),
            )?;
        self.pos += n as u64;
        self.remaining -= 1;
        Ok(Some(atom))
    }
}

impl Iterator for OwnedAtomCursor {
    type Item = Result<Atom, SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_atom().transpose()
    }
}

/// One row as seen by a compaction scanner: the key, its on-disk size,
/// the row-level deletion time, and a recreatable cursor over its atoms.
pub struct RowView {
    pub key: DecoratedKey,
    /// Serialized size of the row body (`row_len`).
    pub data_size: u64,
    pub deletion: DeletionTime,
    pub atom_count: u32,
    cursor: OwnedAtomCursor,
    /// Generation of the table this row came from.
    pub generation: u64,
}

impl RowView {
    /// A fresh cursor over the row's atoms.
    pub fn atoms(&self) -> OwnedAtomCursor {
        let mut cursor = self.cursor.clone();
        cursor.rewind();
        cursor
    }
}

/// Sequential scanner over a table's Data component.
///
/// `current_position` reports the bytes of the data file consumed so
/// far; after the scanner is exhausted it equals the file's length.
pub struct SSTableScanner {
    reader: Arc<SSTableReader>,
    pos: u64,
}

impl SSTableScanner {
    /// A scanner positioned at the start of `reader`'s Data component.
    pub fn new(reader: Arc<SSTableReader>) -> SSTableScanner {
        SSTableScanner { reader, pos: 0 }
    }

    /// Bytes of the Data component consumed so far.
    pub fn current_position(&self) -> u64 {
        self.pos
    }

    /// The reader this scanner iterates.
    pub fn reader(&self) -> &Arc<SSTableReader> {
        &self.reader
    }

    /// Decodes the next row header, leaving the position at the start of
    /// the following row.
    pub fn next_row(&mut self) -> Result<Option<RowView>, SSTableError> {
        if self.pos >= self.reader.data.len() as u64 {
            return Ok(None);
        }
        let header = self.reader.row_header_at(self.pos)?;
        let key = self.reader.partitioner.decorate(header.key.clone());
        let atoms_end = header.row_end;
        let view = RowView {
            key,
            data_size: header.row_len,
            deletion: header.deletion,
            atom_count: header.atom_count,
            cursor: OwnedAtomCursor {
                reader: Arc::clone(&self.reader),
                start: header.atoms_offset,
                end: atoms_end,
                atom_count: header.atom_count,
                pos: header.atoms_offset,
                remaining: header.atom_count,
            },
            generation: self.reader.generation(),
        };
        self.pos = header.row_end;
        Ok(Some(view))
    }
}
