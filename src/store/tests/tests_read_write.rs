#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::row::{
        Cell, ClusteringComparator, DeletionInfo, OrderPreservingPartitioner, QueryFilter, RowData,
    };
    use crate::store::{ColumnFamilyStore, NullIndexes, StoreConfig, SystemContext};

    const CMP: ClusteringComparator = ClusteringComparator::Bytes;

    fn open(tmp: &TempDir) -> Arc<ColumnFamilyStore> {
        open_with(tmp, StoreConfig::default())
    }

    fn open_with(tmp: &TempDir, mut config: StoreConfig) -> Arc<ColumnFamilyStore> {
        config.data_dirs = vec![tmp.path().to_path_buf()];
        ColumnFamilyStore::open(
            "ks",
            "cf",
            config,
            Arc::new(OrderPreservingPartitioner),
            CMP,
            SystemContext::for_tests(),
            Arc::new(NullIndexes),
        )
        .unwrap()
    }

    fn put(store: &Arc<ColumnFamilyStore>, key: &[u8], name: &[u8], value: &[u8], ts: i64) {
        let update = RowData::from_parts(
            &CMP,
            DeletionInfo::live(),
            vec![Cell::Live {
                name: name.to_vec(),
                value: value.to_vec(),
                timestamp: ts,
            }],
        );
        store.apply(&store.decorate(key), &update).unwrap();
    }

    #[test]
    fn test_write_then_read_from_memtable() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        put(&store, b"k1", b"c1", b"v1", 1);

        let row = store
            .get_row(&store.decorate(b"k1"), &QueryFilter::all())
            .unwrap()
            .unwrap();
        assert_eq!(row.data.get(&CMP, b"c1").unwrap().value(), b"v1");
        assert!(store
            .get_row(&store.decorate(b"nope"), &QueryFilter::all())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_collates_memtable_over_sstable() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        put(&store, b"k1", b"c1", b"disk", 1);
        put(&store, b"k1", b"c2", b"disk-only", 1);
        store.force_blocking_flush().unwrap();
        put(&store, b"k1", b"c1", b"memory", 2);

        let row = store
            .get_row(&store.decorate(b"k1"), &QueryFilter::all())
            .unwrap()
            .unwrap();
        assert_eq!(row.data.get(&CMP, b"c1").unwrap().value(), b"memory");
        assert_eq!(row.data.get(&CMP, b"c2").unwrap().value(), b"disk-only");
    }

    #[test]
    fn test_delete_shadows_older_write_across_flush() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        put(&store, b"k1", b"c1", b"v", 1);
        store.force_blocking_flush().unwrap();

        let tombstone = RowData::from_parts(
            &CMP,
            DeletionInfo::live(),
            vec![Cell::Deleted {
                name: b"c1".to_vec(),
                timestamp: 2,
                local_deletion_time: i32::MAX - 1,
            }],
        );
        store.apply(&store.decorate(b"k1"), &tombstone).unwrap();

        let row = store
            .get_row(&store.decorate(b"k1"), &QueryFilter::all())
            .unwrap()
            .unwrap();
        // the live cell is gone; the tombstone is within grace and stays
        assert!(row.data.get(&CMP, b"c1").unwrap().is_tombstone());
    }

    #[test]
    fn test_named_filter_narrows_read() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        for (name, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            put(&store, b"k", name, value, 1);
        }
        store.force_blocking_flush().unwrap();

        let filter = QueryFilter::names(&CMP, vec![b"b".to_vec()]);
        let row = store
            .get_row(&store.decorate(b"k"), &filter)
            .unwrap()
            .unwrap();
        assert_eq!(row.data.cell_count(), 1);
        assert_eq!(row.data.get(&CMP, b"b").unwrap().value(), b"2");
    }

    #[test]
    fn test_row_cache_serves_and_invalidates() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        put(&store, b"k", b"c", b"v1", 1);
        store.force_blocking_flush().unwrap();

        store
            .get_row(&store.decorate(b"k"), &QueryFilter::all())
            .unwrap();
        assert_eq!(store.row_cache().len(), 1);

        // a write invalidates the cached row; the next read sees the update
        put(&store, b"k", b"c", b"v2", 2);
        assert_eq!(store.row_cache().len(), 0);
        let row = store
            .get_row(&store.decorate(b"k"), &QueryFilter::all())
            .unwrap()
            .unwrap();
        assert_eq!(row.data.get(&CMP, b"c").unwrap().value(), b"v2");
    }

    #[test]
    fn test_recovery_reopens_flushed_tables() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            put(&store, b"k1", b"c", b"v1", 1);
            store.force_blocking_flush().unwrap();
            put(&store, b"k2", b"c", b"v2", 1);
            store.force_blocking_flush().unwrap();
        }

        let store = open(&tmp);
        assert_eq!(store.tracker().view().sstables.len(), 2);
        let row = store
            .get_row(&store.decorate(b"k2"), &QueryFilter::all())
            .unwrap()
            .unwrap();
        assert_eq!(row.data.get(&CMP, b"c").unwrap().value(), b"v2");
    }

    #[test]
    fn test_recovery_preserves_level_assignments() {
        let tmp = TempDir::new().unwrap();
        let generation;
        {
            let store = open(&tmp);
            put(&store, b"k1", b"c", b"v1", 1);
            store.force_blocking_flush().unwrap();
            store.force_major_compaction().unwrap();
            let level1 = store.level_sstables(1);
            assert_eq!(level1.len(), 1);
            generation = level1[0].generation();
        }

        let store = open(&tmp);
        assert_eq!(store.level_count(0), 0);
        let level1 = store.level_sstables(1);
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].generation(), generation);
    }
}
