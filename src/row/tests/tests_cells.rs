#[cfg(test)]
mod tests {
    use crate::encoding::{decode_from_slice, encode_to_vec};
    use crate::row::{Atom, Cell, ClusteringComparator, CounterShard, DeletionInfo, RowData};

    fn live(name: &[u8], value: &[u8], timestamp: i64) -> Cell {
        Cell::Live {
            name: name.to_vec(),
            value: value.to_vec(),
            timestamp,
        }
    }

    fn deleted(name: &[u8], timestamp: i64, ldt: i32) -> Cell {
        Cell::Deleted {
            name: name.to_vec(),
            timestamp,
            local_deletion_time: ldt,
        }
    }

    #[test]
    fn test_live_reconcile_by_timestamp() {
        let old = live(b"c", b"old", 1);
        let new = live(b"c", b"new", 2);
        assert_eq!(old.clone().reconcile(new.clone()), new);
        assert_eq!(new.clone().reconcile(old), new);
    }

    #[test]
    fn test_live_tie_breaks_on_value_bytes() {
        let a = live(b"c", b"aaa", 5);
        let b = live(b"c", b"bbb", 5);
        // greater value wins, from either side
        assert_eq!(a.clone().reconcile(b.clone()), b);
        assert_eq!(b.clone().reconcile(a), b);
    }

    #[test]
    fn test_tombstone_wins_timestamp_tie() {
        let data = live(b"c", b"v", 7);
        let tomb = deleted(b"c", 7, 100);
        assert_eq!(data.clone().reconcile(tomb.clone()), tomb);
        assert_eq!(tomb.clone().reconcile(data), tomb);
    }

    #[test]
    fn test_newer_write_beats_older_tombstone() {
        let tomb = deleted(b"c", 5, 100);
        let data = live(b"c", b"v", 6);
        assert_eq!(tomb.reconcile(data.clone()), data);
    }

    #[test]
    fn test_counter_shards_merge() {
        let a = Cell::Counter {
            name: b"cnt".to_vec(),
            shards: vec![
                CounterShard {
                    id: 1,
                    clock: 2,
                    count: 10,
                },
                CounterShard {
                    id: 2,
                    clock: 1,
                    count: 5,
                },
            ],
            timestamp: 10,
        };
        let b = Cell::Counter {
            name: b"cnt".to_vec(),
            shards: vec![
                CounterShard {
                    id: 1,
                    clock: 3,
                    count: 12,
                },
                CounterShard {
                    id: 3,
                    clock: 1,
                    count: 1,
                },
            ],
            timestamp: 11,
        };
        let merged = a.reconcile(b);
        let Cell::Counter {
            shards, timestamp, ..
        } = merged
        else {
            panic!("expected counter");
        };
        assert_eq!(timestamp, 11);
        assert_eq!(
            shards,
            vec![
                CounterShard {
                    id: 1,
                    clock: 3,
                    count: 12
                },
                CounterShard {
                    id: 2,
                    clock: 1,
                    count: 5
                },
                CounterShard {
                    id: 3,
                    clock: 1,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_serialized_size_matches_encoding() {
        let comparator = ClusteringComparator::Bytes;
        let cells = vec![
            live(b"a", b"value-bytes", 1),
            Cell::Expiring {
                name: b"b".to_vec(),
                value: b"v".to_vec(),
                timestamp: 2,
                ttl: 60,
                local_deletion_time: 1000,
            },
            deleted(b"c", 3, 500),
            Cell::Counter {
                name: b"d".to_vec(),
                shards: vec![CounterShard {
                    id: 9,
                    clock: 1,
                    count: -4,
                }],
                timestamp: 4,
            },
        ];
        for cell in cells {
            let atom = Atom::Cell(cell);
            let encoded = encode_to_vec(&atom).unwrap();
            assert_eq!(encoded.len() as u64, atom.serialized_size());
        }

        let mut row = RowData::from_parts(
            &comparator,
            DeletionInfo::live(),
            vec![live(b"x", b"1", 1), live(b"y", b"2", 1)],
        );
        row.deletion.add_range(
            &comparator,
            crate::row::RangeTombstone {
                start: b"p".to_vec(),
                end: b"q".to_vec(),
                timestamp: 1,
                local_deletion_time: 10,
            },
        );
        let atoms = row.atoms(&comparator);
        let encoded: u64 = atoms
            .iter()
            .map(|a| encode_to_vec(a).unwrap().len() as u64)
            .sum();
        assert_eq!(row.serialized_size(), 12 + 4 + encoded);
    }

    #[test]
    fn test_slice_iteration_forward_and_reverse() {
        let comparator = ClusteringComparator::Bytes;
        let row = RowData::from_parts(
            &comparator,
            DeletionInfo::live(),
            vec![
                live(b"a", b"1", 1),
                live(b"b", b"2", 1),
                live(b"c", b"3", 1),
                live(b"d", b"4", 1),
            ],
        );
        let forward: Vec<&[u8]> = row
            .slice(&comparator, b"b", b"c", false)
            .map(|c| c.name())
            .collect();
        assert_eq!(forward, vec![b"b" as &[u8], b"c"]);

        let reverse: Vec<&[u8]> = row
            .slice(&comparator, b"", b"", true)
            .map(|c| c.name())
            .collect();
        assert_eq!(reverse, vec![b"d" as &[u8], b"c", b"b", b"a"]);
    }

    #[test]
    fn test_atom_round_trip() {
        let atoms = vec![
            Atom::Cell(live(b"name", b"value", 42)),
            Atom::Cell(deleted(b"gone", -1, 77)),
            Atom::Range(crate::row::RangeTombstone {
                start: b"a".to_vec(),
                end: b"m".to_vec(),
                timestamp: 3,
                local_deletion_time: 9,
            }),
        ];
        for atom in atoms {
            let bytes = encode_to_vec(&atom).unwrap();
            let (decoded, consumed) = decode_from_slice::<Atom>(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, atom);
        }
    }
}
