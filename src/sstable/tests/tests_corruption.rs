#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::row::{ClusteringComparator, HashPartitioner, QueryFilter};
    use crate::sstable::tests::helpers::{dk, live, partitioner, row, write_table};
    use crate::sstable::{Component, SSTableError, SSTableReader, SSTableScanner};

    #[test]
    fn test_missing_component_refuses_to_open() {
        let tmp = TempDir::new().unwrap();
        let reader = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 1)]))],
            None,
        );
        let descriptor = reader.descriptor.clone();
        drop(reader);

        fs::remove_file(descriptor.path_for(Component::Filter)).unwrap();
        let result = SSTableReader::open(
            descriptor,
            partitioner(),
            ClusteringComparator::Bytes,
            None,
        );
        assert!(matches!(result, Err(SSTableError::IncompleteSet { .. })));
    }

    #[test]
    fn test_summary_crc_mismatch_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let reader = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 1)]))],
            None,
        );
        let descriptor = reader.descriptor.clone();
        drop(reader);

        let path = descriptor.path_for(Component::Summary);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(6)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let result = SSTableReader::open(
            descriptor,
            partitioner(),
            ClusteringComparator::Bytes,
            None,
        );
        assert!(matches!(result, Err(SSTableError::Corrupt { .. })));
    }

    #[test]
    fn test_truncated_data_surfaces_corruption_not_panic() {
        let tmp = TempDir::new().unwrap();
        let rows = (0..20)
            .map(|i| {
                (
                    format!("key-{i:02}").into_bytes(),
                    row(vec![live(b"c", &vec![b'v'; 512], 1)]),
                )
            })
            .collect();
        let reader = write_table(tmp.path(), 1, rows, None);
        let descriptor = reader.descriptor.clone();
        drop(reader);

        // chop the data file mid-row
        let path = descriptor.path_for(Component::Data);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len / 2).unwrap();
        drop(file);

        let reader = Arc::new(
            SSTableReader::open(
                descriptor,
                partitioner(),
                ClusteringComparator::Bytes,
                None,
            )
            .unwrap(),
        );
        let mut scanner = SSTableScanner::new(Arc::clone(&reader));
        let mut result = Ok(());
        loop {
            match scanner.next_row() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        assert!(matches!(result, Err(SSTableError::Corrupt { .. })));
        assert!(!reader.is_suspect());
        reader.mark_suspect();
        assert!(reader.is_suspect());
    }

    #[test]
    fn test_partitioner_mismatch_refuses_to_open() {
        let tmp = TempDir::new().unwrap();
        let reader = write_table(
            tmp.path(),
            1,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 1)]))],
            None,
        );
        let descriptor = reader.descriptor.clone();
        drop(reader);

        let result = SSTableReader::open(
            descriptor,
            Arc::new(HashPartitioner),
            ClusteringComparator::Bytes,
            None,
        );
        assert!(matches!(
            result,
            Err(SSTableError::UnknownPartitioner { .. })
        ));
    }

    #[test]
    fn test_compacted_reader_deletes_files_on_release() {
        let tmp = TempDir::new().unwrap();
        let reader = write_table(
            tmp.path(),
            9,
            vec![(b"k".to_vec(), row(vec![live(b"c", b"v", 1)]))],
            None,
        );
        let descriptor = reader.descriptor.clone();
        let data_path = descriptor.path_for(Component::Data);
        assert!(data_path.exists());

        reader.mark_compacted();
        let second = Arc::clone(&reader);
        drop(reader);
        // still referenced: files stay
        assert!(data_path.exists());
        drop(second);
        assert!(!data_path.exists());
        assert!(!descriptor.path_for(Component::Toc).exists());
    }

    #[test]
    fn test_read_row_detects_index_key_mismatch() {
        let tmp = TempDir::new().unwrap();
        let reader = write_table(
            tmp.path(),
            1,
            vec![
                (b"aa".to_vec(), row(vec![live(b"c", b"1", 1)])),
                (b"bb".to_vec(), row(vec![live(b"c", b"2", 1)])),
            ],
            None,
        );
        // healthy reads pass through untouched
        assert!(reader
            .read_row(&dk(b"aa"), &QueryFilter::all())
            .unwrap()
            .is_some());
    }
}
