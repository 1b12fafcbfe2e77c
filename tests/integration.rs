//! End-to-end scenarios driving the full write → flush → compact → read
//! cycle through the public store API.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use stratadb::compaction::leveled::LeveledScanner;
use stratadb::row::Token;
use stratadb::{
    Cell, ClusteringComparator, ColumnFamilyStore, DeletionInfo, NullIndexes,
    OrderPreservingPartitioner, QueryFilter, RowData, StoreConfig, SystemContext,
};

const CMP: ClusteringComparator = ClusteringComparator::Bytes;

fn open_store(tmp: &TempDir, mut config: StoreConfig) -> Arc<ColumnFamilyStore> {
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

fn live(name: &[u8], value: &[u8], timestamp: i64) -> Cell {
    Cell::Live {
        name: name.to_vec(),
        value: value.to_vec(),
        timestamp,
    }
}

fn put_cells(store: &Arc<ColumnFamilyStore>, key: &[u8], cells: Vec<Cell>) {
    let update = RowData::from_parts(&CMP, DeletionInfo::live(), cells);
    store.apply(&store.decorate(key), &update).unwrap();
}

#[test]
fn leveled_growth_fills_multiple_levels() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        // small output tables so the level targets are reachable
        max_sstable_size: 256 * 1024,
        ..StoreConfig::default()
    };
    let store = open_store(&tmp, config);

    // enough data to need a level 1 and a level 2
    let value = vec![0u8; 100 * 1024];
    for r in 0..20 {
        let cells: Vec<Cell> = (0..10)
            .map(|c| live(format!("column{c}").as_bytes(), &value, 0))
            .collect();
        put_cells(&store, format!("row-{r:02}").as_bytes(), cells);
        store.force_blocking_flush().unwrap();
    }

    while store.level_count(0) > 1 {
        store.force_major_compaction().unwrap();
    }

    assert!(store.level_count(1) > 0, "level 1 stayed empty");
    assert!(store.level_count(2) > 0, "level 2 stayed empty");

    // a validation request over the full token range completes
    let root = store
        .submit_validation((Token::MIN, Token::MAX))
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_ne!(root, [0u8; 32]);

    // every row is still readable with its newest values
    for r in 0..20 {
        let row = store
            .get_row(
                &store.decorate(format!("row-{r:02}").as_bytes()),
                &QueryFilter::all(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.data.cell_count(), 10);
    }
}

#[test]
fn scanner_position_matches_total_data_bytes() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, StoreConfig::default());

    let value = vec![0u8; 100 * 1024];
    for r in 0..2 {
        let cells: Vec<Cell> = (0..10)
            .map(|c| live(format!("column{c}").as_bytes(), &value, 0))
            .collect();
        put_cells(&store, format!("row-{r}").as_bytes(), cells);
        store.force_blocking_flush().unwrap();
    }
    store.force_major_compaction().unwrap();

    let level1 = store.level_sstables(1);
    assert!(!level1.is_empty());
    let total: u64 = level1.iter().map(|r| r.data_size()).sum();

    let mut scanner = LeveledScanner::new(level1);
    while scanner.next_row().unwrap().is_some() {}
    assert_eq!(scanner.current_position(), total);
}

#[test]
fn key_cache_survives_compaction() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, StoreConfig::default());

    put_cells(&store, b"key1", vec![live(b"1", b"", 0)]);
    put_cells(&store, b"key2", vec![live(b"2", b"", 0)]);
    store.force_blocking_flush().unwrap();

    // reads populate the key cache
    store
        .get_row(&store.decorate(b"key1"), &QueryFilter::all())
        .unwrap()
        .unwrap();
    store
        .get_row(&store.decorate(b"key2"), &QueryFilter::all())
        .unwrap()
        .unwrap();
    assert_eq!(store.key_cache().len(), 2);

    // pin the pre-compaction snapshot so the replaced reader stays
    // referenced, as an in-flight read would
    let pinned = store.tracker().view();
    store.force_major_compaction().unwrap();

    // entries exist for old and new tables: 2 + 2
    assert_eq!(store.key_cache().len(), 4);

    // re-reading the same keys does not grow the cache
    store
        .get_row(&store.decorate(b"key1"), &QueryFilter::all())
        .unwrap()
        .unwrap();
    store
        .get_row(&store.decorate(b"key2"), &QueryFilter::all())
        .unwrap()
        .unwrap();
    assert_eq!(store.key_cache().len(), 4);

    // releasing the old reader drops its entries
    drop(pinned);
    assert_eq!(store.key_cache().len(), 2);
}

#[test]
fn tombstone_purges_when_no_older_version_outside_set() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        gc_grace_seconds: 0,
        ..StoreConfig::default()
    };
    let store = open_store(&tmp, config);

    put_cells(&store, b"key", vec![live(b"c", b"v", 1)]);
    store.force_blocking_flush().unwrap();
    put_cells(
        &store,
        b"key",
        vec![Cell::Deleted {
            name: b"c".to_vec(),
            timestamp: 2,
            local_deletion_time: 100, // long past the grace period
        }],
    );
    store.force_blocking_flush().unwrap();

    let generations: Vec<u64> = store
        .level_sstables(0)
        .iter()
        .map(|r| r.generation())
        .collect();
    assert_eq!(generations.len(), 2);
    assert!(store.compact_sstables(&generations, 0).unwrap());

    // data and tombstone annihilated: no output table at all
    assert!(store.tracker().view().sstables.is_empty());
    assert!(store
        .get_row(&store.decorate(b"key"), &QueryFilter::all())
        .unwrap()
        .is_none());
}

#[test]
fn tombstone_survives_when_older_version_exists_outside_set() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig {
        gc_grace_seconds: 0,
        ..StoreConfig::default()
    };
    let store = open_store(&tmp, config);

    // an older version of the key, pushed down to L1
    put_cells(&store, b"key", vec![live(b"c", b"ancient", 1)]);
    store.force_blocking_flush().unwrap();
    let first: Vec<u64> = store
        .level_sstables(0)
        .iter()
        .map(|r| r.generation())
        .collect();
    assert!(store.compact_sstables(&first, 1).unwrap());
    assert_eq!(store.level_count(1), 1);

    // newer write and its deletion, both in L0
    put_cells(&store, b"key", vec![live(b"c", b"v", 5)]);
    store.force_blocking_flush().unwrap();
    put_cells(
        &store,
        b"key",
        vec![Cell::Deleted {
            name: b"c".to_vec(),
            timestamp: 10,
            local_deletion_time: 100,
        }],
    );
    store.force_blocking_flush().unwrap();

    let l0: Vec<u64> = store
        .level_sstables(0)
        .iter()
        .map(|r| r.generation())
        .collect();
    assert_eq!(l0.len(), 2);
    assert!(store.compact_sstables(&l0, 0).unwrap());

    // the L1 table holds an older version, so the tombstone survived
    let l0_tables = store.level_sstables(0);
    assert_eq!(l0_tables.len(), 1);
    let fragment = l0_tables[0]
        .read_row(&store.decorate(b"key"), &QueryFilter::all())
        .unwrap()
        .unwrap();
    assert_eq!(fragment.cells.len(), 1);
    assert!(fragment.cells[0].is_tombstone());
}

#[test]
fn oracle_equivalence_under_flush_and_compaction() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, StoreConfig::default());

    // oracle: (key, column) -> (timestamp, live value or tombstone)
    let mut oracle: BTreeMap<(Vec<u8>, Vec<u8>), (i64, Option<Vec<u8>>)> = BTreeMap::new();
    let mut apply_oracle = |key: &[u8], name: &[u8], ts: i64, value: Option<Vec<u8>>| {
        let slot = oracle.entry((key.to_vec(), name.to_vec())).or_insert((
            i64::MIN,
            None,
        ));
        // last-writer-wins, tombstone wins ties
        if ts > slot.0 || (ts == slot.0 && value.is_none()) {
            *slot = (ts, value);
        }
    };

    let keys: Vec<Vec<u8>> = (0..8).map(|i| format!("key-{i}").into_bytes()).collect();
    let columns: Vec<Vec<u8>> = (0..4).map(|i| format!("col-{i}").into_bytes()).collect();

    let mut rng = StdRng::seed_from_u64(0x5742_4442);
    let mut ts = 0i64;
    for round in 0..6 {
        for (ki, key) in keys.iter().enumerate() {
            for (ci, column) in columns.iter().enumerate() {
                ts += 1;
                if rng.gen_ratio(1, 5) {
                    // delete with a drop time far inside the grace period
                    put_cells(
                        &store,
                        key,
                        vec![Cell::Deleted {
                            name: column.clone(),
                            timestamp: ts,
                            local_deletion_time: i32::MAX - 1,
                        }],
                    );
                    apply_oracle(key, column, ts, None);
                } else {
                    let value = format!("v{round}.{ki}.{ci}").into_bytes();
                    put_cells(&store, key, vec![live(column, &value, ts)]);
                    apply_oracle(key, column, ts, Some(value));
                }
            }
        }
        store.force_blocking_flush().unwrap();
        if round % 2 == 1 {
            store.force_major_compaction().unwrap();
        }
    }

    for key in &keys {
        let row = store
            .get_row(&store.decorate(key), &QueryFilter::all())
            .unwrap()
            .unwrap();
        for column in &columns {
            let expected = oracle.get(&(key.clone(), column.clone()));
            let actual = row.data.get(&CMP, column);
            match expected {
                Some((ts, Some(value))) => {
                    let cell = actual.unwrap_or_else(|| {
                        panic!(
                            "missing {}/{}",
                            String::from_utf8_lossy(key),
                            String::from_utf8_lossy(column)
                        )
                    });
                    assert!(!cell.is_tombstone());
                    assert_eq!(cell.value(), value.as_slice());
                    assert_eq!(cell.timestamp(), *ts);
                }
                Some((ts, None)) => {
                    // the tombstone is inside grace: it must be visible
                    let cell = actual.expect("tombstone dropped");
                    assert!(cell.is_tombstone());
                    assert_eq!(cell.timestamp(), *ts);
                }
                None => assert!(actual.is_none()),
            }
        }
    }
}

#[test]
fn compacting_single_clean_table_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, StoreConfig::default());

    for i in 0..10 {
        put_cells(
            &store,
            format!("key-{i}").as_bytes(),
            vec![live(b"c", b"value", 1)],
        );
    }
    store.force_blocking_flush().unwrap();

    let before = store.level_sstables(0);
    assert_eq!(before.len(), 1);
    let original = std::fs::read(
        before[0]
            .descriptor
            .path_for(stratadb::sstable::Component::Data),
    )
    .unwrap();
    let generation = before[0].generation();
    drop(before);

    assert!(store.compact_sstables(&[generation], 0).unwrap());
    let after = store.level_sstables(0);
    assert_eq!(after.len(), 1);
    let rewritten = std::fs::read(
        after[0]
            .descriptor
            .path_for(stratadb::sstable::Component::Data),
    )
    .unwrap();
    assert_eq!(original, rewritten, "clean recompaction changed bytes");
}
