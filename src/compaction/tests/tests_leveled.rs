#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::leveled::{
        LeveledManifest, LeveledScanner, L0_COMPACTION_THRESHOLD,
    };
    use crate::row::RowData;
    use crate::sstable::tests::helpers::{live, row, write_table};
    use crate::sstable::SSTableReader;

    fn table(
        tmp: &TempDir,
        generation: u64,
        first: &str,
        last: &str,
    ) -> Arc<SSTableReader> {
        let rows: Vec<(Vec<u8>, RowData)> = vec![
            (first.as_bytes().to_vec(), row(vec![live(b"c", b"v", 1)])),
            (last.as_bytes().to_vec(), row(vec![live(b"c", b"v", 1)])),
        ];
        write_table(tmp.path(), generation, rows, None)
    }

    fn manifest(tmp: &TempDir) -> LeveledManifest {
        LeveledManifest::new(tmp.path().join("cf-manifest.db"), 1024 * 1024)
    }

    #[test]
    fn test_flushed_tables_land_in_l0() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        manifest.add_flushed(table(&tmp, 1, "a", "m")).unwrap();
        manifest.add_flushed(table(&tmp, 2, "b", "z")).unwrap();
        assert_eq!(manifest.level_count(0), 2);
        assert_eq!(manifest.level_count(1), 0);
        assert_eq!(manifest.level_of(1), Some(0));
    }

    #[test]
    fn test_l0_scores_by_count() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        for generation in 1..=3 {
            manifest
                .add_flushed(table(&tmp, generation, "a", "z"))
                .unwrap();
        }
        assert!(manifest.score(0) < 1.0);
        assert!(manifest
            .compaction_candidates(&HashSet::new())
            .is_none());

        manifest.add_flushed(table(&tmp, 4, "a", "z")).unwrap();
        assert!(manifest.score(0) >= 1.0);
        let candidate = manifest
            .compaction_candidates(&HashSet::new())
            .expect("L0 at threshold must compact");
        assert_eq!(candidate.level, 0);
        assert_eq!(candidate.target_level, 1);
        assert_eq!(candidate.sstables.len(), L0_COMPACTION_THRESHOLD);
    }

    #[test]
    fn test_replace_moves_inputs_to_target_level() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        let a = table(&tmp, 1, "a", "f");
        let b = table(&tmp, 2, "c", "m");
        manifest.add_flushed(Arc::clone(&a)).unwrap();
        manifest.add_flushed(Arc::clone(&b)).unwrap();

        let merged = table(&tmp, 3, "a", "m");
        manifest
            .replace(&[a, b], &[Arc::clone(&merged)], 1)
            .unwrap();
        assert_eq!(manifest.level_count(0), 0);
        assert_eq!(manifest.level_count(1), 1);
        assert_eq!(manifest.level_of(3), Some(1));
    }

    #[test]
    fn test_l1_kept_ordered_and_disjoint() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        let left = table(&tmp, 1, "a", "f");
        let right = table(&tmp, 2, "p", "z");
        let middle = table(&tmp, 3, "g", "o");
        manifest.replace(&[], &[right], 1).unwrap();
        manifest.replace(&[], &[left], 1).unwrap();
        manifest.replace(&[], &[middle], 1).unwrap();

        let firsts: Vec<Vec<u8>> = manifest
            .level(1)
            .iter()
            .map(|r| r.first().key.clone())
            .collect();
        assert_eq!(firsts, vec![b"a".to_vec(), b"g".to_vec(), b"p".to_vec()]);
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn test_overlap_in_l1_is_a_hard_bug() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        let a = table(&tmp, 1, "a", "m");
        let b = table(&tmp, 2, "f", "z");
        manifest.replace(&[], &[a], 1).unwrap();
        manifest.replace(&[], &[b], 1).unwrap();
    }

    #[test]
    fn test_recovered_overlap_demotes_to_l0() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        let a = table(&tmp, 1, "a", "m");
        let b = table(&tmp, 2, "f", "z");
        manifest.add_recovered(a, 1).unwrap();
        manifest.add_recovered(b, 1).unwrap();
        assert_eq!(manifest.level_count(1), 1);
        assert_eq!(manifest.level_count(0), 1);
    }

    #[test]
    fn test_leveled_candidates_pull_overlapping_next_level() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = LeveledManifest::new(tmp.path().join("cf-manifest.db"), 8);
        // tiny max size: the L1 byte target is 5 * 8 bytes, far exceeded
        let l1 = table(&tmp, 1, "a", "m");
        let l2_hit = table(&tmp, 2, "a", "g");
        let l2_miss = table(&tmp, 3, "n", "z");
        manifest.replace(&[], &[l1], 1).unwrap();
        manifest.replace(&[], &[l2_hit], 2).unwrap();
        manifest.replace(&[], &[l2_miss], 2).unwrap();

        let candidate = manifest
            .compaction_candidates(&HashSet::new())
            .expect("oversized L1 must compact");
        assert_eq!(candidate.level, 1);
        assert_eq!(candidate.target_level, 2);
        let generations = candidate.generations();
        assert!(generations.contains(&1));
        assert!(generations.contains(&2));
        assert!(!generations.contains(&3));
    }

    #[test]
    fn test_claimed_tables_are_not_reselected() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = manifest(&tmp);
        for generation in 1..=4 {
            manifest
                .add_flushed(table(&tmp, generation, "a", "z"))
                .unwrap();
        }
        let mut compacting = HashSet::new();
        compacting.extend([1u64, 2, 3, 4]);
        assert!(manifest.compaction_candidates(&compacting).is_none());
        assert!(manifest.forced_l0_candidates(&compacting).is_none());
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cf-manifest.db");
        let mut manifest = LeveledManifest::new(path.clone(), 1024 * 1024);
        let l0 = table(&tmp, 1, "a", "m");
        let l1 = table(&tmp, 2, "n", "z");
        manifest.add_flushed(l0).unwrap();
        manifest.replace(&[], &[l1], 1).unwrap();

        let recovered = LeveledManifest::read_snapshot(&path).unwrap();
        assert_eq!(recovered.get(&1), Some(&0));
        assert_eq!(recovered.get(&2), Some(&1));

        // a missing snapshot is an empty layout
        let empty =
            LeveledManifest::read_snapshot(&tmp.path().join("absent-manifest.db")).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_scanner_position_equals_total_bytes() {
        let tmp = TempDir::new().unwrap();
        let tables = vec![
            table(&tmp, 1, "a", "f"),
            table(&tmp, 2, "g", "m"),
            table(&tmp, 3, "n", "z"),
        ];
        let total: u64 = tables.iter().map(|r| r.data_size()).sum();

        let mut scanner = LeveledScanner::new(tables);
        let mut rows = 0;
        while scanner.next_row().unwrap().is_some() {
            assert!(scanner.current_position() <= total);
            rows += 1;
        }
        assert_eq!(rows, 6);
        assert_eq!(scanner.current_position(), total);
    }
}
