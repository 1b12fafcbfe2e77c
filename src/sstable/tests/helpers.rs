//! Shared builders for sorted-table tests.

use std::path::Path;
use std::sync::Arc;

use crate::row::{
    Cell, ClusteringComparator, DecoratedKey, DeletionInfo, OrderPreservingPartitioner,
    Partitioner, PartitionerRef, RowData,
};
use crate::sstable::{Descriptor, MetadataCollector, SSTableReader, SSTableWriter};
use crate::stats::ReplayPosition;
use crate::tracker::KeyCache;

pub const CMP: ClusteringComparator = ClusteringComparator::Bytes;

pub fn partitioner() -> PartitionerRef {
    Arc::new(OrderPreservingPartitioner)
}

pub fn dk(raw: &[u8]) -> DecoratedKey {
    OrderPreservingPartitioner.decorate(raw.to_vec())
}

pub fn live(name: &[u8], value: &[u8], timestamp: i64) -> Cell {
    Cell::Live {
        name: name.to_vec(),
        value: value.to_vec(),
        timestamp,
    }
}

pub fn row(cells: Vec<Cell>) -> RowData {
    RowData::from_parts(&CMP, DeletionInfo::live(), cells)
}

pub fn writer_for(dir: &Path, generation: u64, estimated_rows: usize) -> SSTableWriter {
    let descriptor = Descriptor::new(dir, "ks", "cf", generation);
    let collector = MetadataCollector::new().replay_position(ReplayPosition::NONE);
    SSTableWriter::create(
        descriptor,
        estimated_rows,
        0.01,
        CMP,
        partitioner(),
        collector,
        64 * 1024,
        4, // small summary interval so index scans cross samples
    )
    .unwrap()
}

/// Writes `rows` (sorted here) into generation `generation` under `dir`.
pub fn write_table(
    dir: &Path,
    generation: u64,
    rows: Vec<(Vec<u8>, RowData)>,
    key_cache: Option<Arc<KeyCache>>,
) -> Arc<SSTableReader> {
    let mut decorated: Vec<(DecoratedKey, RowData)> = rows
        .into_iter()
        .map(|(key, data)| (dk(&key), data))
        .collect();
    decorated.sort_by(|a, b| a.0.cmp(&b.0));

    let mut writer = writer_for(dir, generation, decorated.len());
    for (key, data) in &decorated {
        writer.append(key, data).unwrap();
    }
    writer.close_and_open_reader(key_cache).unwrap()
}
