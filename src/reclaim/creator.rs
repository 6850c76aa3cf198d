//! Reclaim map creation for one merge plan.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{MergeError, Result};
use crate::reclaim::doc_iterator::{IndexHeap, WeightedDocIterator, compare_current};
use crate::reclaim::map::{ReclaimMap, ReclaimMapBuilder};
use crate::reclaim::sort::{AttributeSource, SortDescriptions};
use crate::reclaim::split::{SegmentSplitHandler, SingleTargetHandler};
use crate::segment::{DeletionMap, DeletionMapReader, DocId, SegmentId, SegmentMergeInfo};

/// Builds the reclaim map of one plan's input segments.
pub trait ReclaimMapCreator: Send + Sync {
    /// Create the map. `split` assigns retained documents to target segments;
    /// without it everything goes to a single target.
    fn create(
        &self,
        segments: &[SegmentMergeInfo],
        deletions: &dyn DeletionMapReader,
        split: Option<&mut dyn SegmentSplitHandler>,
    ) -> Result<ReclaimMap>;
}

/// Keeps segment order, then local order, dropping deleted documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsortedReclaimMapCreator;

impl ReclaimMapCreator for UnsortedReclaimMapCreator {
    fn create(
        &self,
        segments: &[SegmentMergeInfo],
        deletions: &dyn DeletionMapReader,
        split: Option<&mut dyn SegmentSplitHandler>,
    ) -> Result<ReclaimMap> {
        let mut single = SingleTargetHandler;
        let split: &mut dyn SegmentSplitHandler = match split {
            Some(handler) => handler,
            None => &mut single,
        };
        let mut builder = ReclaimMapBuilder::new(segments, split.target_segment_count())?;

        for segment in segments {
            for local in 0..segment.doc_count {
                let old = segment.base_doc_id + local;
                if deletions.is_deleted(old) {
                    continue;
                }
                let target = split.target_segment_index(segment.segment_id, local);
                builder.assign(old, target)?;
            }
        }

        let map = builder.build();
        log::debug!(
            "unsorted reclaim map over {} segments: {} retained, {} dropped",
            segments.len(),
            map.new_doc_count(),
            map.deleted_doc_count()
        );
        Ok(map)
    }
}

/// Orders retained documents by a multi-key sort with a k-way heap merge.
///
/// Each input segment must be sorted already, and a segment whose keys go
/// backwards fails with `CorruptData`. Equal keys from
/// different segments go to the higher segment id first, and documents of one
/// segment keep their local order.
pub struct SortedReclaimMapCreator {
    source: Arc<dyn AttributeSource>,
    sort: SortDescriptions,
}

impl SortedReclaimMapCreator {
    pub fn new(source: Arc<dyn AttributeSource>, sort: SortDescriptions) -> Result<Self> {
        if sort.is_empty() {
            return Err(MergeError::configuration(
                "sorted reclaim map needs at least one sort field",
            ));
        }
        Ok(SortedReclaimMapCreator { source, sort })
    }

    pub fn sort_descriptions(&self) -> &SortDescriptions {
        &self.sort
    }
}

impl std::fmt::Debug for SortedReclaimMapCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedReclaimMapCreator")
            .field("sort", &self.sort)
            .finish()
    }
}

impl ReclaimMapCreator for SortedReclaimMapCreator {
    fn create(
        &self,
        segments: &[SegmentMergeInfo],
        deletions: &dyn DeletionMapReader,
        split: Option<&mut dyn SegmentSplitHandler>,
    ) -> Result<ReclaimMap> {
        let mut single = SingleTargetHandler;
        let split: &mut dyn SegmentSplitHandler = match split {
            Some(handler) => handler,
            None => &mut single,
        };
        let mut builder = ReclaimMapBuilder::new(segments, split.target_segment_count())?;

        let mut arena: Vec<WeightedDocIterator<'_>> = segments
            .iter()
            .map(|segment| {
                WeightedDocIterator::new(*segment, self.source.as_ref(), &self.sort, deletions)
            })
            .collect();

        let mut heap = IndexHeap::with_capacity(arena.len());
        for idx in 0..arena.len() {
            if arena[idx].advance()? {
                heap.push(idx, |a, b| compare_current(&self.sort, &arena[a], &arena[b]));
            }
        }

        while let Some(idx) = heap.pop(|a, b| compare_current(&self.sort, &arena[a], &arena[b])) {
            let iter = &mut arena[idx];
            let (Some(old), Some(local)) = (iter.current_global(), iter.current_local()) else {
                return Err(MergeError::internal("exhausted iterator in merge heap"));
            };
            let target = split.target_segment_index(iter.segment_id(), local);
            builder.assign(old, target)?;

            if iter.advance()? {
                heap.push(idx, |a, b| compare_current(&self.sort, &arena[a], &arena[b]));
            }
        }

        let map = builder.build();
        log::debug!(
            "sorted reclaim map ({}) over {} segments: {} retained, {} dropped",
            self.sort,
            segments.len(),
            map.new_doc_count(),
            map.deleted_doc_count()
        );
        Ok(map)
    }
}

/// Main-to-sub document join: which sub documents a main document owns.
pub trait JoinSource: Send + Sync {
    /// Local sub-doc id range owned by a main document of `segment_id`.
    fn sub_doc_range(&self, segment_id: SegmentId, local_main_doc_id: u32) -> Result<Range<u32>>;

    /// Sub documents stored alongside segment `segment_id`.
    fn sub_doc_count(&self, segment_id: SegmentId) -> Result<u32>;

    /// Deleted local sub-doc ids of `segment_id`.
    fn deleted_sub_docs(&self, _segment_id: SegmentId) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }
}

/// Join stored as per-segment end offsets: main doc `i` owns sub docs
/// `ends[i-1]..ends[i]`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJoinSource {
    ends: HashMap<SegmentId, Vec<u32>>,
    deleted: HashMap<SegmentId, Vec<u32>>,
}

impl InMemoryJoinSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment's join column (cumulative sub-doc end offsets).
    pub fn with_segment(mut self, segment_id: SegmentId, ends: Vec<u32>) -> Self {
        self.ends.insert(segment_id, ends);
        self
    }

    pub fn with_deleted_sub_docs(mut self, segment_id: SegmentId, deleted: Vec<u32>) -> Self {
        self.deleted.insert(segment_id, deleted);
        self
    }

    fn ends(&self, segment_id: SegmentId) -> Result<&[u32]> {
        self.ends
            .get(&segment_id)
            .map(Vec::as_slice)
            .ok_or_else(|| MergeError::not_found(format!("join column of segment {segment_id}")))
    }
}

impl JoinSource for InMemoryJoinSource {
    fn sub_doc_range(&self, segment_id: SegmentId, local_main_doc_id: u32) -> Result<Range<u32>> {
        let ends = self.ends(segment_id)?;
        let idx = local_main_doc_id as usize;
        let end = *ends.get(idx).ok_or_else(|| {
            MergeError::logic(format!(
                "main doc {local_main_doc_id} out of range for join of segment {segment_id}"
            ))
        })?;
        let start = if idx == 0 { 0 } else { ends[idx - 1] };
        if start > end {
            return Err(MergeError::corrupt(format!(
                "join column of segment {segment_id} is not monotonic at doc {local_main_doc_id}"
            )));
        }
        Ok(start..end)
    }

    fn sub_doc_count(&self, segment_id: SegmentId) -> Result<u32> {
        Ok(self.ends(segment_id)?.last().copied().unwrap_or(0))
    }

    fn deleted_sub_docs(&self, segment_id: SegmentId) -> Result<Vec<u32>> {
        Ok(self.deleted.get(&segment_id).cloned().unwrap_or_default())
    }
}

/// Sub segments of the main `segments`, laid out back to back in the same
/// order, with their deletions.
pub fn sub_segments_of(
    segments: &[SegmentMergeInfo],
    join: &dyn JoinSource,
) -> Result<(Vec<SegmentMergeInfo>, DeletionMap)> {
    let mut sub_segments = Vec::with_capacity(segments.len());
    let mut deletions = DeletionMap::new();
    let mut base: DocId = 0;
    for segment in segments {
        let doc_count = join.sub_doc_count(segment.segment_id)?;
        deletions.add_segment(segment.segment_id, base, doc_count);
        let mut deleted = 0;
        for local in join.deleted_sub_docs(segment.segment_id)? {
            if local >= doc_count {
                return Err(MergeError::corrupt(format!(
                    "deleted sub doc {local} beyond the {doc_count} sub docs of segment {}",
                    segment.segment_id
                )));
            }
            if deletions.delete_local(segment.segment_id, local)? {
                deleted += 1;
            }
        }
        sub_segments.push(SegmentMergeInfo::new(segment.segment_id, base, doc_count, deleted));
        base = base.checked_add(doc_count).ok_or_else(|| {
            MergeError::resource_exceeded("sub doc ids of one plan overflow 32 bits")
        })?;
    }
    Ok((sub_segments, deletions))
}

/// Derive the sub-document reclaim map from the main one.
///
/// Sub documents follow their main document: they are emitted in main new-id
/// order, land in the main document's target and keep their local order.
/// Sub documents of dropped main documents are dropped, as are deleted ones.
pub fn create_sub_doc_reclaim_map(
    main_map: &ReclaimMap,
    join: &dyn JoinSource,
    sub_segments: &[SegmentMergeInfo],
    sub_deletions: &dyn DeletionMapReader,
) -> Result<ReclaimMap> {
    let mut builder = ReclaimMapBuilder::new(sub_segments, main_map.target_segment_count().max(1))?;

    for (new_main, &old_main) in main_map.new_to_old().iter().enumerate() {
        let (segment_id, local_main) = main_map.locate_old(old_main).ok_or_else(|| {
            MergeError::internal(format!("main doc {old_main} missing from its reclaim map"))
        })?;
        let sub_segment = sub_segments
            .iter()
            .find(|info| info.segment_id == segment_id)
            .ok_or_else(|| {
                MergeError::not_found(format!("sub segment of segment {segment_id}"))
            })?;
        let (target, _) = main_map.target_of(new_main as u32).ok_or_else(|| {
            MergeError::internal(format!("new main doc {new_main} has no target"))
        })?;

        let range = join.sub_doc_range(segment_id, local_main)?;
        if range.end > sub_segment.doc_count {
            return Err(MergeError::corrupt(format!(
                "main doc {local_main} of segment {segment_id} joins past the sub segment end"
            )));
        }
        for local_sub in range {
            let old_sub = sub_segment.base_doc_id + local_sub;
            if !sub_deletions.is_deleted(old_sub) {
                builder.assign(old_sub, target)?;
            }
        }
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeValue;
    use crate::reclaim::sort::InMemoryAttributeSource;
    use crate::reclaim::split::BalancedSplitHandler;
    use crate::segment::NoDeletions;

    fn deletions(segments: &[SegmentMergeInfo], deleted: &[u32]) -> DeletionMap {
        let mut map = DeletionMap::new();
        for info in segments {
            map.add_segment(info.segment_id, info.base_doc_id, info.doc_count);
        }
        for &doc in deleted {
            map.delete(doc).unwrap();
        }
        map
    }

    #[test]
    fn test_unsorted_scenario_with_deletion() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 5, 0),
            SegmentMergeInfo::new(1, 5, 5, 1),
        ];
        let deletions = deletions(&segments, &[6]);
        let map = UnsortedReclaimMapCreator
            .create(&segments, &deletions, None)
            .unwrap();

        let expected = [
            Some(0),
            Some(1),
            Some(2),
            Some(3),
            Some(4),
            Some(5),
            None,
            Some(6),
            Some(7),
            Some(8),
        ];
        for (old, new) in expected.iter().enumerate() {
            assert_eq!(map.get_new_id(old as u32), *new, "old doc {old}");
        }
        assert!(map.is_deleted(6));
        assert_eq!(map.new_doc_count(), 9);
    }

    #[test]
    fn test_unsorted_empty_input() {
        let map = UnsortedReclaimMapCreator
            .create(&[], &NoDeletions, None)
            .unwrap();
        assert!(map.is_empty());
        assert_eq!(map.old_doc_count(), 0);
    }

    #[test]
    fn test_unsorted_split_keeps_ids_contiguous() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 4, 0),
            SegmentMergeInfo::new(1, 4, 4, 0),
        ];
        let mut split = BalancedSplitHandler::new(2, 8).unwrap();
        let map = UnsortedReclaimMapCreator
            .create(&segments, &NoDeletions, Some(&mut split))
            .unwrap();
        assert_eq!(map.target_doc_counts(), &[4, 4]);
        assert_eq!(map.get_new_id(5), Some(5));
        assert_eq!(map.target_of(5), Some((1, 1)));
    }

    fn int_column(values: &[Option<i64>]) -> Vec<Option<AttributeValue>> {
        values.iter().map(|v| v.map(AttributeValue::Int)).collect()
    }

    #[test]
    fn test_sorted_descending_with_nulls_and_ties() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 3, 0),
            SegmentMergeInfo::new(1, 3, 3, 0),
        ];
        let source = InMemoryAttributeSource::new()
            .with_column(0, "price", int_column(&[Some(9), Some(5), None]))
            .with_column(1, "price", int_column(&[Some(7), Some(5), Some(1)]));
        let creator = SortedReclaimMapCreator::new(
            Arc::new(source),
            SortDescriptions::parse("-price").unwrap(),
        )
        .unwrap();

        let map = creator.create(&segments, &NoDeletions, None).unwrap();
        // 9, 7, 5 (segment 1 first), 5, 1, null
        assert_eq!(map.new_to_old(), &[0, 3, 4, 1, 5, 2]);
    }

    #[test]
    fn test_sorted_skips_deleted_docs() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 2, 1),
            SegmentMergeInfo::new(1, 2, 2, 0),
        ];
        let deletions = deletions(&segments, &[0]);
        let source = InMemoryAttributeSource::new()
            .with_column(0, "ts", int_column(&[Some(1), Some(4)]))
            .with_column(1, "ts", int_column(&[Some(2), Some(3)]));
        let creator =
            SortedReclaimMapCreator::new(Arc::new(source), SortDescriptions::parse("+ts").unwrap())
                .unwrap();

        let map = creator.create(&segments, &deletions, None).unwrap();
        assert_eq!(map.new_to_old(), &[2, 3, 1]);
        assert!(map.is_deleted(0));
    }

    #[test]
    fn test_sorted_rejects_unsorted_segment() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 2, 0),
            SegmentMergeInfo::new(1, 2, 1, 0),
        ];
        let source = InMemoryAttributeSource::new()
            .with_column(0, "ts", int_column(&[Some(5), Some(1)]))
            .with_column(1, "ts", int_column(&[Some(3)]));
        let creator =
            SortedReclaimMapCreator::new(Arc::new(source), SortDescriptions::parse("+ts").unwrap())
                .unwrap();

        assert!(matches!(
            creator.create(&segments, &NoDeletions, None),
            Err(MergeError::CorruptData(_))
        ));
    }

    #[test]
    fn test_sorted_requires_sort_fields() {
        let source: Arc<dyn AttributeSource> = Arc::new(InMemoryAttributeSource::new());
        assert!(SortedReclaimMapCreator::new(source, SortDescriptions::default()).is_err());
    }

    #[test]
    fn test_sub_doc_map_follows_main_docs() {
        // Two main segments; main doc 1 of segment 0 is deleted.
        let main_segments = vec![
            SegmentMergeInfo::new(0, 0, 2, 1),
            SegmentMergeInfo::new(1, 2, 1, 0),
        ];
        let main_deletions = deletions(&main_segments, &[1]);
        let main_map = UnsortedReclaimMapCreator
            .create(&main_segments, &main_deletions, None)
            .unwrap();

        let sub_segments = vec![
            SegmentMergeInfo::new(0, 0, 3, 0),
            SegmentMergeInfo::new(1, 3, 2, 1),
        ];
        let sub_deletions = deletions(&sub_segments, &[4]);
        let join = InMemoryJoinSource::new()
            .with_segment(0, vec![1, 3])
            .with_segment(1, vec![2]);

        let sub_map =
            create_sub_doc_reclaim_map(&main_map, &join, &sub_segments, &sub_deletions).unwrap();
        assert_eq!(sub_map.new_to_old(), &[0, 3]);
        assert!(sub_map.is_deleted(1));
        assert!(sub_map.is_deleted(2));
        assert!(sub_map.is_deleted(4));
    }

    #[test]
    fn test_sub_segments_follow_main_order() {
        let main_segments = vec![
            SegmentMergeInfo::new(4, 0, 2, 0),
            SegmentMergeInfo::new(7, 2, 1, 0),
        ];
        let join = InMemoryJoinSource::new()
            .with_segment(4, vec![1, 3])
            .with_segment(7, vec![2])
            .with_deleted_sub_docs(7, vec![1]);
        let (subs, deletions) = sub_segments_of(&main_segments, &join).unwrap();
        assert_eq!(
            subs,
            vec![
                SegmentMergeInfo::new(4, 0, 3, 0),
                SegmentMergeInfo::new(7, 3, 2, 1),
            ]
        );
        assert!(deletions.is_deleted(4));
        assert!(!deletions.is_deleted(3));

        let bad = InMemoryJoinSource::new()
            .with_segment(4, vec![1, 3])
            .with_segment(7, vec![2])
            .with_deleted_sub_docs(7, vec![2]);
        assert!(matches!(
            sub_segments_of(&main_segments, &bad),
            Err(MergeError::CorruptData(_))
        ));
    }

    #[test]
    fn test_join_source_errors() {
        let join = InMemoryJoinSource::new().with_segment(0, vec![2, 1]);
        assert!(matches!(join.sub_doc_range(0, 1), Err(MergeError::CorruptData(_))));
        assert!(matches!(join.sub_doc_range(0, 2), Err(MergeError::Logic(_))));
        assert!(matches!(join.sub_doc_range(9, 0), Err(MergeError::NotFound(_))));
    }
}
