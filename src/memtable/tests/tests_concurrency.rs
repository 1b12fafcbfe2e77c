#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::memtable::Memtable;
    use crate::row::{
        Cell, ClusteringComparator, DeletionInfo, OrderPreservingPartitioner, Partitioner, RowData,
    };
    use crate::store::NullIndexes;

    const CMP: ClusteringComparator = ClusteringComparator::Bytes;

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        let memtable = Arc::new(Memtable::new(CMP));
        let mut handles = Vec::new();
        for writer in 0..4 {
            let memtable = Arc::clone(&memtable);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let key = OrderPreservingPartitioner
                        .decorate(format!("w{writer}-k{i:03}").into_bytes());
                    let update = RowData::from_parts(
                        &CMP,
                        DeletionInfo::live(),
                        vec![Cell::Live {
                            name: b"c".to_vec(),
                            value: vec![writer as u8],
                            timestamp: 1,
                        }],
                    );
                    memtable.put(&key, &update, &NullIndexes).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(memtable.partition_count(), 400);
        assert_eq!(memtable.operations(), 400);
    }

    #[test]
    fn test_concurrent_writers_same_key_last_writer_wins() {
        let memtable = Arc::new(Memtable::new(CMP));
        let key = OrderPreservingPartitioner.decorate(b"contended".to_vec());
        let mut handles = Vec::new();
        for writer in 0..4u8 {
            let memtable = Arc::clone(&memtable);
            let key = key.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50i64 {
                    let update = RowData::from_parts(
                        &CMP,
                        DeletionInfo::live(),
                        vec![Cell::Live {
                            name: b"c".to_vec(),
                            value: vec![writer],
                            timestamp: i64::from(writer) * 100 + i,
                        }],
                    );
                    memtable.put(&key, &update, &NullIndexes).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // the single surviving version carries the highest timestamp
        let row = memtable.get_row(&key).unwrap().unwrap();
        assert_eq!(memtable.partition_count(), 1);
        assert_eq!(row.cell_count(), 1);
        assert_eq!(row.get(&CMP, b"c").unwrap().timestamp(), 3 * 100 + 49);
        assert_eq!(row.get(&CMP, b"c").unwrap().value(), &[3u8]);
    }

    #[test]
    fn test_readers_see_consistent_rows_during_writes() {
        let memtable = Arc::new(Memtable::new(CMP));
        let key = OrderPreservingPartitioner.decorate(b"k".to_vec());

        let writer = {
            let memtable = Arc::clone(&memtable);
            let key = key.clone();
            thread::spawn(move || {
                for i in 0..200i64 {
                    let update = RowData::from_parts(
                        &CMP,
                        DeletionInfo::live(),
                        vec![
                            Cell::Live {
                                name: b"a".to_vec(),
                                value: i.to_le_bytes().to_vec(),
                                timestamp: i,
                            },
                            Cell::Live {
                                name: b"b".to_vec(),
                                value: i.to_le_bytes().to_vec(),
                                timestamp: i,
                            },
                        ],
                    );
                    memtable.put(&key, &update, &NullIndexes).unwrap();
                }
            })
        };

        let reader = {
            let memtable = Arc::clone(&memtable);
            let key = key.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(row) = memtable.get_row(&key).unwrap() {
                        // both cells were written under one row lock, so a
                        // snapshot never shows them torn apart
                        assert_eq!(row.cell_count(), 2);
                        assert_eq!(
                            row.get(&CMP, b"a").unwrap().timestamp(),
                            row.get(&CMP, b"b").unwrap().timestamp()
                        );
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
