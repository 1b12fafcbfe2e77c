#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::{CompactedRow, CompactionController};
    use crate::memtable::Memtable;
    use crate::row::{Cell, DeletionInfo, RowData};
    use crate::sstable::tests::helpers::{dk, live, row, write_table, writer_for, CMP};
    use crate::sstable::{RowView, SSTableReader, SSTableScanner};
    use crate::store::NullIndexes;
    use crate::tracker::DataTracker;

    fn tracker_with(readers: Vec<Arc<SSTableReader>>) -> DataTracker {
        let tracker = DataTracker::new(Arc::new(Memtable::new(CMP)));
        tracker.add_sstables(readers);
        tracker
    }

    fn first_row(reader: &Arc<SSTableReader>) -> RowView {
        let mut scanner = SSTableScanner::new(Arc::clone(&reader));
        scanner.next_row().unwrap().unwrap()
    }

    fn controller_for(
        tracker: &DataTracker,
        inputs: &[Arc<SSTableReader>],
        gc_before: i32,
    ) -> CompactionController {
        CompactionController::new(
            &tracker.view(),
            inputs,
            gc_before,
            0,
            CMP,
            None,
            64 * 1024 * 1024,
            false,
        )
    }

    #[test]
    fn test_purge_allowed_when_no_overlap_outside_set() {
        let tmp = TempDir::new().unwrap();
        let input = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 5)]))],
            None,
        );
        let tracker = tracker_with(vec![Arc::clone(&input)]);
        let controller = controller_for(&tracker, &[input], 1000);
        assert!(controller.should_purge(&dk(b"k"), i64::MAX).unwrap());
    }

    #[test]
    fn test_purge_blocked_by_older_overlapping_table() {
        let tmp = TempDir::new().unwrap();
        // older data for the key, outside the compaction set
        let older = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"old", 5)]))],
            None,
        );
        let input = write_table(
            tmp.path(),
            2,
            vec![(
                b"k".to_vec(),
                RowData::from_parts(&CMP, DeletionInfo::deleted_at(10, 100), vec![]),
            )],
            None,
        );
        let tracker = tracker_with(vec![Arc::clone(&older), Arc::clone(&input)]);
        let controller = controller_for(&tracker, &[input], 1000);

        // the older table's min timestamp (5) precedes the deletion (10)
        // and its filter admits the key
        assert!(!controller.should_purge(&dk(b"k"), 10).unwrap());
        // a key the older table cannot hold purges freely
        assert!(controller.should_purge(&dk(b"other"), 10).unwrap());
        // a deletion older than anything the older table holds is safe
        assert!(controller.should_purge(&dk(b"k"), 4).unwrap());
    }

    #[test]
    fn test_precompacted_purges_when_safe() {
        let tmp = TempDir::new().unwrap();
        let with_data = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 5)]))],
            None,
        );
        let with_tombstone = write_table(
            tmp.path(),
            2,
            vec![(
                b"k".to_vec(),
                row(vec![Cell::Deleted {
                    name: b"c".to_vec(),
                    timestamp: 10,
                    local_deletion_time: 100,
                }]),
            )],
            None,
        );
        let tracker = tracker_with(vec![Arc::clone(&with_data), Arc::clone(&with_tombstone)]);
        // both versions are inside the set; gc_before is past the drop time
        let inputs = vec![with_data, with_tombstone];
        let controller = controller_for(&tracker, &inputs, 1000);

        let fragments = vec![first_row(&inputs[0]), first_row(&inputs[1])];
        let compacted = controller.compacted_row(fragments, &NullIndexes).unwrap();
        // data and tombstone annihilate: nothing to write
        assert!(compacted.is_none());
    }

    #[test]
    fn test_precompacted_preserves_tombstone_when_blocked() {
        let tmp = TempDir::new().unwrap();
        let older = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"old", 5)]))],
            None,
        );
        let input = write_table(
            tmp.path(),
            2,
            vec![(
                b"k".to_vec(),
                row(vec![Cell::Deleted {
                    name: b"c".to_vec(),
                    timestamp: 10,
                    local_deletion_time: 100,
                }]),
            )],
            None,
        );
        let tracker = tracker_with(vec![Arc::clone(&older), Arc::clone(&input)]);
        let inputs = vec![input];
        let controller = controller_for(&tracker, &inputs, 1000);

        let fragments = vec![first_row(&inputs[0])];
        let compacted = controller
            .compacted_row(fragments, &NullIndexes)
            .unwrap()
            .expect("tombstone must survive");
        let CompactedRow::Precompacted { row, .. } = compacted else {
            panic!("small row should precompact");
        };
        assert_eq!(row.cell_count(), 1);
        assert!(row.cells()[0].is_tombstone());
    }

    #[test]
    fn test_large_rows_take_the_lazy_path_and_write_identically() {
        let tmp = TempDir::new().unwrap();
        let cells: Vec<Cell> = (0..200)
            .map(|i| live(format!("col-{i:04}").as_bytes(), &vec![b'x'; 512], i))
            .collect();
        let reader = write_table(tmp.path(), 1, vec![(b"big".to_vec(), row(cells))], None);
        let tracker = tracker_with(vec![Arc::clone(&reader)]);
        let inputs = vec![Arc::clone(&reader)];

        // limit far below the row size forces the lazy materialisation
        let controller = CompactionController::new(
            &tracker.view(),
            &inputs,
            0,
            0,
            CMP,
            None,
            1024,
            false,
        );
        let compacted = controller
            .compacted_row(vec![first_row(&reader)], &NullIndexes)
            .unwrap()
            .expect("row survives");
        assert!(matches!(compacted, CompactedRow::Lazy(_)));

        let mut writer = writer_for(tmp.path(), 2, 1);
        compacted.write(&mut writer).unwrap().expect("row written");
        let rewritten = writer.close_and_open_reader(None).unwrap();

        // the lazily rewritten data component is byte-identical
        let original = std::fs::read(
            reader
                .descriptor
                .path_for(crate::sstable::Component::Data),
        )
        .unwrap();
        let copied = std::fs::read(
            rewritten
                .descriptor
                .path_for(crate::sstable::Component::Data),
        )
        .unwrap();
        assert_eq!(original, copied);
    }
}
