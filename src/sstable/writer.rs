//! Sorted-table writer.
//!
//! Consumes rows in ascending decorated-key order and produces a
//! complete component set. The TOC is written last, so a crash or an
//! [`SSTableWriter::abort`] leaves nothing a reader would open; recovery
//! sweeps component files with no TOC.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Arc;

use bloomfilter::Bloom;
use tracing::{debug, info};

use crate::encoding::{self, Encode};
use crate::row::{
    Atom, ClusteringComparator, ColumnStats, DecoratedKey, DeletionTime, PartitionerRef, RowData,
};
use crate::tracker::KeyCache;

use super::{
    metadata::MetadataCollector, write_toc, Component, Descriptor, IndexInfo, RowIndexEntry,
    SSTableError, SSTableReader, FILTER_MAGIC, SUMMARY_MAGIC,
};

/// Streaming writer for one sorted table.
pub struct SSTableWriter {
    descriptor: Descriptor,
    comparator: ClusteringComparator,
    partitioner: PartitionerRef,
    data: BufWriter<File>,
    data_pos: u64,
    index: BufWriter<File>,
    index_pos: u64,
    summary: Vec<(Vec<u8>, u64)>,
    summary_interval: u32,
    bloom: Bloom<[u8]>,
    collector: MetadataCollector,
    column_index_size: u64,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    last_written: Option<DecoratedKey>,
    rows_written: u64,
    finished: bool,
}

impl SSTableWriter {
    /// Creates the Data and Index files and an empty writer.
    ///
    /// `estimated_rows` sizes the bloom filter; `collector` should
    /// already carry the replay position and ancestors for this table.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        descriptor: Descriptor,
        estimated_rows: usize,
        bloom_fp_chance: f64,
        comparator: ClusteringComparator,
        partitioner: PartitionerRef,
        collector: MetadataCollector,
        column_index_size: u64,
        summary_interval: u32,
    ) -> Result<SSTableWriter, SSTableError> {
        let data = BufWriter::new(Self::create_file(&descriptor, Component::Data)?);
        let index = BufWriter::new(Self::create_file(&descriptor, Component::Index)?);
        let bloom = Bloom::new_for_fp_rate(estimated_rows.max(1), bloom_fp_chance)
            .map_err(|e| SSTableError::Internal(format!("bloom filter sizing: {e}")))?;

        debug!(descriptor = %descriptor, estimated_rows, "creating sstable writer");

        Ok(SSTableWriter {
            descriptor,
            comparator,
            partitioner,
            data,
            data_pos: 0,
            index,
            index_pos: 0,
            summary: Vec::new(),
            summary_interval,
            bloom,
            collector,
            column_index_size,
            first_key: None,
            last_key: None,
            last_written: None,
            rows_written: 0,
            finished: false,
        })
    }

    fn create_file(descriptor: &Descriptor, component: Component) -> Result<File, SSTableError> {
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(descriptor.path_for(component))?)
    }

    /// The descriptor this writer produces.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Bytes written to the Data component so far.
    pub fn data_size(&self) -> u64 {
        self.data_pos
    }

    /// Rows appended so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// The promoted-index block threshold this writer was created with.
    pub fn column_index_size(&self) -> u64 {
        self.column_index_size
    }

    /// Appends a fully materialized row.
    pub fn append(
        &mut self,
        key: &DecoratedKey,
        row: &RowData,
    ) -> Result<RowIndexEntry, SSTableError> {
        let atoms = row.atoms(&self.comparator);
        let mut atom_buf = Vec::new();
        let mut boundaries = Vec::with_capacity(atoms.len());
        for atom in &atoms {
            let start = atom_buf.len() as u64;
            atom.encode_to(&mut atom_buf)?;
            boundaries.push((atom.name().to_vec(), start, atom_buf.len() as u64));
        }
        let promoted = self.build_promoted(&boundaries, atom_buf.len() as u64);
        self.append_encoded(
            key,
            row.deletion.top,
            atoms.len() as u32,
            &atom_buf,
            &promoted,
            &row.column_stats(),
        )
    }

    /// Appends a row whose atom stream was computed ahead of time (the
    /// lazily compacted path): the caller supplies the pre-measured
    /// length, the promoted index blocks, and a second-pass atom
    /// iterator that must produce exactly `atoms_len` encoded bytes.
    pub fn append_stream(
        &mut self,
        key: &DecoratedKey,
        deletion: DeletionTime,
        atom_count: u32,
        atoms_len: u64,
        promoted: &[IndexInfo],
        atoms: impl Iterator<Item = Result<Atom, SSTableError>>,
        stats: &ColumnStats,
    ) -> Result<RowIndexEntry, SSTableError> {
        let mut promoted_buf = Vec::new();
        if !promoted.is_empty() {
            encoding::encode_seq(promoted, &mut promoted_buf)?;
        }
        let entry = self.write_row_header(key, deletion, atom_count, atoms_len, &promoted_buf)?;

        let mut written = 0u64;
        let mut atom_buf = Vec::new();
        for atom in atoms {
            let atom = atom?;
            atom_buf.clear();
            atom.encode_to(&mut atom_buf)?;
            self.data.write_all(&atom_buf)?;
            written += atom_buf.len() as u64;
        }
        if written != atoms_len {
            return Err(SSTableError::Internal(format!(
                "streamed row length mismatch: expected {atoms_len}, wrote {written}"
            )));
        }
        self.data.write_all(&promoted_buf)?;
        self.data_pos += atoms_len + promoted_buf.len() as u64;

        self.finish_row(key, atoms_len + 12 + 4 + promoted_buf.len() as u64, stats);
        Ok(entry)
    }

    fn build_promoted(&self, boundaries: &[(Vec<u8>, u64, u64)], total: u64) -> Vec<IndexInfo> {
        promoted_blocks(boundaries, total, self.column_index_size)
    }

    fn append_encoded(
        &mut self,
        key: &DecoratedKey,
        deletion: DeletionTime,
        atom_count: u32,
        atom_buf: &[u8],
        promoted: &[IndexInfo],
        stats: &ColumnStats,
    ) -> Result<RowIndexEntry, SSTableError> {
        let mut promoted_buf = Vec::new();
        if !promoted.is_empty() {
            encoding::encode_seq(promoted, &mut promoted_buf)?;
        }
        let entry = self.write_row_header(
            key,
            deletion,
            atom_count,
            atom_buf.len() as u64,
            &promoted_buf,
        )?;
        self.data.write_all(atom_buf)?;
        self.data.write_all(&promoted_buf)?;
        self.data_pos += atom_buf.len() as u64 + promoted_buf.len() as u64;

        self.finish_row(
            key,
            12 + 4 + atom_buf.len() as u64 + promoted_buf.len() as u64,
            stats,
        );
        Ok(entry)
    }

    /// Writes the row header and the index entry. Leaves the data file
    /// positioned at the start of the atom region.
    fn write_row_header(
        &mut self,
        key: &DecoratedKey,
        deletion: DeletionTime,
        atom_count: u32,
        atoms_len: u64,
        promoted_buf: &[u8],
    ) -> Result<RowIndexEntry, SSTableError> {
        if let Some(last) = &self.last_written {
            if last >= key {
                return Err(SSTableError::Internal(format!(
                    "rows appended out of order: {last:?} then {key:?}"
                )));
            }
        }

        let position = self.data_pos;
        let row_len = 12 + 4 + atoms_len + promoted_buf.len() as u64;
        let promoted_offset = if promoted_buf.is_empty() {
            0
        } else {
            position + 2 + key.key.len() as u64 + 8 + 12 + 4 + atoms_len
        };

        let mut header = Vec::with_capacity(2 + key.key.len() + 8 + 12 + 4);
        header.extend_from_slice(&(key.key.len() as u16).to_le_bytes());
        header.extend_from_slice(&key.key);
        header.extend_from_slice(&row_len.to_le_bytes());
        deletion.encode_to(&mut header)?;
        header.extend_from_slice(&atom_count.to_le_bytes());
        self.data.write_all(&header)?;
        self.data_pos += header.len() as u64;

        // index entry; summary samples every `summary_interval` entries
        if self.rows_written % self.summary_interval as u64 == 0 {
            self.summary.push((key.key.clone(), self.index_pos));
        }
        let mut index_entry = Vec::with_capacity(2 + key.key.len() + 16);
        index_entry.extend_from_slice(&(key.key.len() as u16).to_le_bytes());
        index_entry.extend_from_slice(&key.key);
        index_entry.extend_from_slice(&position.to_le_bytes());
        index_entry.extend_from_slice(&promoted_offset.to_le_bytes());
        self.index.write_all(&index_entry)?;
        self.index_pos += index_entry.len() as u64;

        self.last_written = Some(key.clone());
        Ok(RowIndexEntry {
            position,
            promoted_offset,
        })
    }

    fn finish_row(&mut self, key: &DecoratedKey, row_len: u64, stats: &ColumnStats) {
        self.bloom.set(key.key.as_slice());
        if self.first_key.is_none() {
            self.first_key = Some(key.key.clone());
        }
        self.last_key = Some(key.key.clone());
        self.collector.update(row_len, stats);
        self.rows_written += 1;
    }

    /// Removes every file produced so far. After an abort nothing of the
    /// table is visible: the TOC was never written.
    pub fn abort(mut self) {
        self.finished = true;
        self.remove_files();
        info!(descriptor = %self.descriptor, "aborted sstable writer");
    }

    fn remove_files(&self) {
        for component in Component::ALL {
            let _ = fs::remove_file(self.descriptor.path_for(component));
        }
    }

    /// Flushes and fsyncs everything, writes the Summary, Filter,
    /// Statistics and TOC components, and opens a reader over the
    /// finished table.
    pub fn close_and_open_reader(
        mut self,
        key_cache: Option<Arc<KeyCache>>,
    ) -> Result<Arc<SSTableReader>, SSTableError> {
        if self.rows_written == 0 {
            self.finished = true;
            self.remove_files();
            return Err(SSTableError::Internal(
                "cannot close an sstable with no rows; abort instead".into(),
            ));
        }

        self.data.flush()?;
        self.data.get_ref().sync_all()?;
        self.index.flush()?;
        self.index.get_ref().sync_all()?;

        // Summary
        let mut body = Vec::new();
        body.extend_from_slice(&SUMMARY_MAGIC);
        self.summary_interval.encode_to(&mut body)?;
        self.first_key.clone().unwrap_or_default().encode_to(&mut body)?;
        self.last_key.clone().unwrap_or_default().encode_to(&mut body)?;
        (self.summary.len() as u32).encode_to(&mut body)?;
        for (key, offset) in &self.summary {
            key.encode_to(&mut body)?;
            offset.encode_to(&mut body)?;
        }
        body.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        fs::write(self.descriptor.path_for(Component::Summary), &body)?;

        // Filter
        let mut body = Vec::new();
        body.extend_from_slice(&FILTER_MAGIC);
        self.bloom.as_slice().encode_to(&mut body)?;
        body.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        fs::write(self.descriptor.path_for(Component::Filter), &body)?;

        // Statistics
        let collector = std::mem::take(&mut self.collector);
        let metadata = collector.finalize(self.partitioner.name());
        let stats_bytes = metadata.serialize(self.descriptor.version)?;
        fs::write(self.descriptor.path_for(Component::Statistics), &stats_bytes)?;

        // TOC last: the commit point
        write_toc(&self.descriptor)?;

        info!(
            descriptor = %self.descriptor,
            rows = self.rows_written,
            data_bytes = self.data_pos,
            "closed sstable"
        );

        self.finished = true;
        let descriptor = self.descriptor.clone();
        let partitioner = Arc::clone(&self.partitioner);
        let comparator = self.comparator;
        drop(self);
        Ok(Arc::new(SSTableReader::open(
            descriptor,
            partitioner,
            comparator,
            key_cache,
        )?))
    }
}

impl Drop for SSTableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.remove_files();
        }
    }
}

/// Splits an atom stream into promoted index blocks of roughly
/// `column_index_size` bytes each. `boundaries` holds
/// `(name, start_offset, end_offset)` per atom; offsets are relative to
/// the row's atom region. Returns an empty list for rows under the
/// threshold.
pub(crate) fn promoted_blocks(
    boundaries: &[(Vec<u8>, u64, u64)],
    total: u64,
    column_index_size: u64,
) -> Vec<IndexInfo> {
    if total <= column_index_size || boundaries.is_empty() {
        return Vec::new();
    }
    let mut blocks = Vec::new();
    let mut block_start: Option<(Vec<u8>, u64)> = None;
    let mut last_name: &[u8] = &[];
    let mut block_end = 0u64;
    for (name, start, end) in boundaries {
        if block_start.is_none() {
            block_start = Some((name.clone(), *start));
        }
        last_name = name;
        block_end = *end;
        let block_offset = block_start.as_ref().map(|(_, s)| *s).unwrap_or(0);
        if block_end - block_offset >= column_index_size {
            if let Some((first, offset)) = block_start.take() {
                blocks.push(IndexInfo {
                    first_name: first,
                    last_name: last_name.to_vec(),
                    offset,
                    width: block_end - offset,
                });
            }
        }
    }
    if let Some((first, offset)) = block_start {
        blocks.push(IndexInfo {
            first_name: first,
            last_name: last_name.to_vec(),
            offset,
            width: block_end - offset,
        });
    }
    blocks
}
