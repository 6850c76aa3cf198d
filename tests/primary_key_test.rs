#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use segmerge::error::MergeError;
    use segmerge::primary_key::{
        CombineSegmentsLoadStrategy, PrimaryKeyIndexType, PrimaryKeyLoadStrategy, PrimaryKeyLoader,
        PrimaryKeySegmentData, PrimaryKeySegmentFormatter, hash_primary_key,
    };
    use segmerge::segment::{SegmentCatalog, SegmentDirectory};
    use segmerge::storage::{FileStorage, Storage};
    use tempfile::TempDir;

    /// Segment 1 is realtime and is laid out after the offline segments.
    fn directory(deleted_realtime: &[u32]) -> SegmentDirectory {
        let json = format!(
            r#"{{
                "version_id": 7,
                "level_count": 1,
                "segments": [
                    {{"segment_id": 0, "doc_count": 3}},
                    {{"segment_id": 1, "doc_count": 2, "is_realtime": true, "deleted_docs": {deleted_realtime:?}}},
                    {{"segment_id": 2, "doc_count": 2}}
                ]
            }}"#
        );
        SegmentDirectory::from_catalog(&SegmentCatalog::from_json(&json).unwrap()).unwrap()
    }

    fn storage_with_keys(dir: &TempDir) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()).unwrap());
        PrimaryKeySegmentData::from_keys(0, &["a", "b", "c"])
            .store(storage.as_ref())
            .unwrap();
        PrimaryKeySegmentData::from_keys(1, &["a", "x"])
            .store(storage.as_ref())
            .unwrap();
        PrimaryKeySegmentData::from_keys(2, &["a", "y"])
            .store(storage.as_ref())
            .unwrap();
        storage
    }

    #[test]
    fn test_realtime_segments_load_last() {
        let directory = directory(&[]);
        let plans = CombineSegmentsLoadStrategy::new(4)
            .unwrap()
            .create_load_plans(directory.segments(), directory.deletion_map())
            .unwrap();
        let groups: Vec<_> = plans.iter().map(|p| p.segment_ids.clone()).collect();
        assert_eq!(groups, vec![vec![0], vec![2, 1]]);
        assert_eq!(plans[1].base_doc_id, 3);
        assert!(plans[1].contains(6));
        assert!(!plans[1].contains(7));
    }

    #[test]
    fn test_every_backend_answers_alike() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_keys(&dir);
        let directory = directory(&[]);

        for index_type in [
            PrimaryKeyIndexType::HashTable,
            PrimaryKeyIndexType::SortedVector,
            PrimaryKeyIndexType::BlockVector,
        ] {
            let loader = PrimaryKeyLoader::new(
                Box::new(CombineSegmentsLoadStrategy::new(4).unwrap()),
                PrimaryKeySegmentFormatter::new(index_type)
                    .with_storage(storage.clone())
                    .with_block_size(2),
            );
            let reader = loader.load(&storage, &directory).unwrap();
            assert_eq!(reader.plan_count(), 2, "{index_type:?}");
            // The realtime copy of "a" is the newest.
            assert_eq!(reader.find_key("a").unwrap(), Some(5), "{index_type:?}");
            assert_eq!(reader.find_key("c").unwrap(), Some(2));
            assert_eq!(reader.find_key("y").unwrap(), Some(4));
            assert_eq!(reader.find_key("x").unwrap(), Some(6));
            assert_eq!(reader.find_key("missing").unwrap(), None);
        }
    }

    #[test]
    fn test_deleted_realtime_doc_uncovers_older_key() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_keys(&dir);
        let loader = PrimaryKeyLoader::new(
            Box::new(CombineSegmentsLoadStrategy::default()),
            PrimaryKeySegmentFormatter::new(PrimaryKeyIndexType::SortedVector),
        );
        let reader = loader.load(&storage, &directory(&[0])).unwrap();
        assert_eq!(reader.plan_count(), 1);
        assert_eq!(reader.find_key("a").unwrap(), Some(3));
        assert_eq!(reader.find_key("x").unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_async_lookup_matches_sync() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_keys(&dir);
        let loader = PrimaryKeyLoader::new(
            Box::new(CombineSegmentsLoadStrategy::new(3).unwrap()),
            PrimaryKeySegmentFormatter::new(PrimaryKeyIndexType::BlockVector)
                .with_storage(storage.clone()),
        );
        let reader = loader.load(&storage, &directory(&[])).unwrap();
        for key in ["a", "b", "c", "x", "y", "z"] {
            let hash = hash_primary_key(key);
            assert_eq!(
                reader.find_async(hash).await.unwrap(),
                reader.find(hash).unwrap(),
                "key {key}"
            );
        }
    }

    #[test]
    fn test_missing_segment_data_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()).unwrap());
        PrimaryKeySegmentData::from_keys(0, &["a", "b", "c"])
            .store(storage.as_ref())
            .unwrap();
        let loader = PrimaryKeyLoader::new(
            Box::new(CombineSegmentsLoadStrategy::default()),
            PrimaryKeySegmentFormatter::new(PrimaryKeyIndexType::HashTable),
        );
        assert!(matches!(
            loader.load(&storage, &directory(&[])),
            Err(MergeError::NotFound(_))
        ));
    }

    #[test]
    fn test_doc_count_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_keys(&dir);
        PrimaryKeySegmentData::from_keys(2, &["a", "y", "extra"])
            .store(storage.as_ref())
            .unwrap();
        let loader = PrimaryKeyLoader::new(
            Box::new(CombineSegmentsLoadStrategy::default()),
            PrimaryKeySegmentFormatter::new(PrimaryKeyIndexType::HashTable),
        );
        assert!(matches!(
            loader.load(&storage, &directory(&[])),
            Err(MergeError::CorruptData(_))
        ));
    }
}
