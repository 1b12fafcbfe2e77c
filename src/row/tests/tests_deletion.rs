#[cfg(test)]
mod tests {
    use crate::row::{
        Atom, Cell, ClusteringComparator, DeletionInfo, DeletionTime, RangeTombstone, RowData,
    };

    const CMP: ClusteringComparator = ClusteringComparator::Bytes;

    fn live(name: &[u8], timestamp: i64) -> Cell {
        Cell::Live {
            name: name.to_vec(),
            value: b"v".to_vec(),
            timestamp,
        }
    }

    fn tombstone(name: &[u8], timestamp: i64, ldt: i32) -> Cell {
        Cell::Deleted {
            name: name.to_vec(),
            timestamp,
            local_deletion_time: ldt,
        }
    }

    fn range(start: &[u8], end: &[u8], timestamp: i64, ldt: i32) -> RangeTombstone {
        RangeTombstone {
            start: start.to_vec(),
            end: end.to_vec(),
            timestamp,
            local_deletion_time: ldt,
        }
    }

    #[test]
    fn test_row_tombstone_shadows_older_cells() {
        let mut row = RowData::from_parts(
            &CMP,
            DeletionInfo::deleted_at(10, 100),
            vec![live(b"old", 5), live(b"new", 11)],
        );
        // write-path form: shadowed cells go, the tombstone stays
        row.remove_deleted(&CMP, i32::MIN);
        assert_eq!(row.cell_count(), 1);
        assert!(row.get(&CMP, b"new").is_some());
        assert_eq!(row.deletion.top.marked_for_delete_at, 10);
    }

    #[test]
    fn test_range_tombstone_shadows_covered_cells() {
        let mut deletion = DeletionInfo::live();
        deletion.add_range(&CMP, range(b"b", b"d", 10, 100));
        let mut row = RowData::from_parts(
            &CMP,
            deletion,
            vec![live(b"a", 5), live(b"c", 5), live(b"c2", 20), live(b"e", 5)],
        );
        row.remove_deleted(&CMP, i32::MIN);
        // "c" is covered and older; "c2" is covered but newer; "a"/"e" outside
        assert!(row.get(&CMP, b"a").is_some());
        assert!(row.get(&CMP, b"c").is_none());
        assert!(row.get(&CMP, b"c2").is_some());
        assert!(row.get(&CMP, b"e").is_some());
        assert_eq!(row.deletion.range_count(), 1);
    }

    #[test]
    fn test_write_path_never_drops_cell_tombstones() {
        let mut row = RowData::from_parts(
            &CMP,
            DeletionInfo::live(),
            vec![tombstone(b"c", 5, 1)],
        );
        row.remove_deleted(&CMP, i32::MIN);
        assert_eq!(row.cell_count(), 1);
        assert!(row.cells()[0].is_tombstone());
    }

    #[test]
    fn test_purge_drops_expired_tombstones() {
        let mut deletion = DeletionInfo::deleted_at(1, 50);
        deletion.add_range(&CMP, range(b"a", b"b", 2, 60));
        deletion.add_range(&CMP, range(b"x", b"y", 2, 500));
        let mut row = RowData::from_parts(
            &CMP,
            deletion,
            vec![tombstone(b"c", 5, 70), tombstone(b"d", 5, 300), live(b"e", 9)],
        );
        // gc_before = 100: everything with an older drop time goes
        row.remove_deleted(&CMP, 100);
        assert!(row.deletion.top.is_live());
        assert_eq!(row.deletion.range_count(), 1);
        assert!(row.get(&CMP, b"c").is_none());
        assert!(row.get(&CMP, b"d").is_some());
        assert!(row.get(&CMP, b"e").is_some());
    }

    #[test]
    fn test_has_irrelevant_data() {
        let row = RowData::from_parts(&CMP, DeletionInfo::live(), vec![live(b"a", 1)]);
        assert!(!row.has_irrelevant_data(100));

        let row = RowData::from_parts(
            &CMP,
            DeletionInfo::live(),
            vec![tombstone(b"a", 1, 50)],
        );
        assert!(row.has_irrelevant_data(100));
        assert!(!row.has_irrelevant_data(10));

        let row = RowData::from_parts(&CMP, DeletionInfo::deleted_at(1, 50), vec![]);
        assert!(row.has_irrelevant_data(100));
    }

    #[test]
    fn test_atoms_interleave_ranges_before_cells() {
        let mut deletion = DeletionInfo::live();
        deletion.add_range(&CMP, range(b"c", b"d", 1, 1));
        deletion.add_range(&CMP, range(b"a", b"b", 1, 1));
        let row = RowData::from_parts(
            &CMP,
            deletion,
            vec![live(b"a", 2), live(b"c", 9), live(b"z", 2)],
        );
        let atoms = row.atoms(&CMP);
        let names: Vec<&[u8]> = atoms.iter().map(Atom::name).collect();
        assert_eq!(names, vec![b"a" as &[u8], b"a", b"c", b"c", b"z"]);
        assert!(matches!(atoms[0], Atom::Range(_)));
        assert!(matches!(atoms[1], Atom::Cell(_)));
        assert!(matches!(atoms[2], Atom::Range(_)));
    }

    #[test]
    fn test_deletion_merge_takes_newest_top() {
        let mut a = DeletionInfo::deleted_at(5, 100);
        let b = DeletionInfo::deleted_at(9, 120);
        a.merge(&CMP, &b);
        assert_eq!(a.top.marked_for_delete_at, 9);

        let older = DeletionInfo::deleted_at(2, 90);
        a.merge(&CMP, &older);
        assert_eq!(a.top.marked_for_delete_at, 9);
    }

    #[test]
    fn test_max_timestamp_covers_deletions() {
        let mut deletion = DeletionInfo::live();
        deletion.add_range(&CMP, range(b"a", b"b", 50, 1));
        let row = RowData::from_parts(&CMP, deletion, vec![live(b"x", 7)]);
        assert_eq!(row.max_timestamp(), 50);
        assert_eq!(
            RowData::from_parts(&CMP, DeletionInfo::live(), vec![]).deletion.top,
            DeletionTime::LIVE
        );
    }
}
