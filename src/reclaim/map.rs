//! The reclaim map: old global doc id to new doc id or deleted.

use std::ops::Range;

use crate::error::{MergeError, Result};
use crate::segment::{DocId, SegmentId, SegmentMergeInfo};
use crate::storage::{Storage, StructReader, StructWriter};

const RECLAIM_MAP_MAGIC: u32 = 0x5245_434C; // "RECL"
const RECLAIM_MAP_VERSION: u32 = 1;

/// Marker for a dropped document in the old-to-new table.
const DELETED: DocId = DocId::MAX;

/// An input segment of a reclaim map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSegment {
    pub segment_id: SegmentId,
    pub base_doc_id: DocId,
    pub doc_count: u32,
    /// Offset of the segment's first slot in the old-to-new table.
    offset: usize,
}

impl ReclaimSegment {
    fn old_range(&self) -> Range<DocId> {
        self.base_doc_id..self.base_doc_id + self.doc_count
    }
}

/// Translation table produced by one merge plan.
///
/// Retained documents get new ids forming `[0, new_doc_count)`. When the plan
/// writes several target segments, each target owns a contiguous slice of
/// that range, laid out in target order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReclaimMap {
    segments: Vec<ReclaimSegment>,
    old_to_new: Vec<DocId>,
    new_to_old: Vec<DocId>,
    target_doc_counts: Vec<u32>,
}

impl ReclaimMap {
    /// An empty map over no segments.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[ReclaimSegment] {
        &self.segments
    }

    /// Number of retained documents.
    pub fn new_doc_count(&self) -> u32 {
        self.new_to_old.len() as u32
    }

    /// Number of input documents, dropped ones included.
    pub fn old_doc_count(&self) -> u32 {
        self.old_to_new.len() as u32
    }

    pub fn deleted_doc_count(&self) -> u32 {
        self.old_doc_count() - self.new_doc_count()
    }

    pub fn is_empty(&self) -> bool {
        self.new_to_old.is_empty()
    }

    fn slot(&self, old_doc_id: DocId) -> Option<usize> {
        let idx = self
            .segments
            .partition_point(|segment| segment.base_doc_id <= old_doc_id);
        let segment = self.segments.get(idx.checked_sub(1)?)?;
        segment
            .old_range()
            .contains(&old_doc_id)
            .then(|| segment.offset + (old_doc_id - segment.base_doc_id) as usize)
    }

    /// Whether `old_doc_id` belongs to one of the map's input segments.
    pub fn contains(&self, old_doc_id: DocId) -> bool {
        self.slot(old_doc_id).is_some()
    }

    /// New id of a retained document, `None` if it was dropped or is not an input.
    pub fn get_new_id(&self, old_doc_id: DocId) -> Option<DocId> {
        let new_id = self.old_to_new[self.slot(old_doc_id)?];
        (new_id != DELETED).then_some(new_id)
    }

    /// Whether an input document was dropped by the merge.
    pub fn is_deleted(&self, old_doc_id: DocId) -> bool {
        self.slot(old_doc_id)
            .is_some_and(|slot| self.old_to_new[slot] == DELETED)
    }

    /// Old global id of a new document.
    pub fn get_old_id(&self, new_doc_id: DocId) -> Option<DocId> {
        self.new_to_old.get(new_doc_id as usize).copied()
    }

    /// Old ids in new-id order.
    pub fn new_to_old(&self) -> &[DocId] {
        &self.new_to_old
    }

    /// `(segment_id, local_doc_id)` of an old global id.
    pub fn locate_old(&self, old_doc_id: DocId) -> Option<(SegmentId, u32)> {
        self.slot(old_doc_id)?;
        let idx = self
            .segments
            .partition_point(|segment| segment.base_doc_id <= old_doc_id);
        let segment = &self.segments[idx - 1];
        Some((segment.segment_id, old_doc_id - segment.base_doc_id))
    }

    /// Old-to-new pairs in old-id order; `None` marks a dropped document.
    pub fn iter(&self) -> impl Iterator<Item = (DocId, Option<DocId>)> + '_ {
        self.segments.iter().flat_map(move |segment| {
            segment.old_range().map(move |old| {
                let new_id = self.old_to_new[segment.offset + (old - segment.base_doc_id) as usize];
                (old, (new_id != DELETED).then_some(new_id))
            })
        })
    }

    pub fn target_segment_count(&self) -> usize {
        self.target_doc_counts.len()
    }

    /// Retained documents per target segment.
    pub fn target_doc_counts(&self) -> &[u32] {
        &self.target_doc_counts
    }

    /// First new id of each target segment.
    pub fn target_base_doc_ids(&self) -> Vec<DocId> {
        self.target_doc_counts
            .iter()
            .scan(0u32, |base, &count| {
                let current = *base;
                *base += count;
                Some(current)
            })
            .collect()
    }

    /// New id range of one target segment.
    pub fn target_range(&self, target_idx: usize) -> Option<Range<DocId>> {
        let base = self.target_base_doc_ids().get(target_idx).copied()?;
        Some(base..base + self.target_doc_counts[target_idx])
    }

    /// `(target_idx, id within target)` of a new doc id.
    pub fn target_of(&self, new_doc_id: DocId) -> Option<(usize, DocId)> {
        let mut base = 0u32;
        for (idx, &count) in self.target_doc_counts.iter().enumerate() {
            if new_doc_id < base + count {
                return Some((idx, new_doc_id - base));
            }
            base += count;
        }
        None
    }

    /// Storage name for a plan's persisted map.
    pub fn file_name(plan_id: usize) -> String {
        format!("merge_meta/MergePlan_{plan_id}.reclaim_map")
    }

    /// Storage name for a plan's persisted sub-document map.
    pub fn sub_file_name(plan_id: usize) -> String {
        format!("merge_meta/MergePlan_{plan_id}.sub_reclaim_map")
    }

    /// Persist the map.
    pub fn store(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let temp_name = format!("{name}.tmp");
        let output = storage.create_output(&temp_name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(RECLAIM_MAP_MAGIC, RECLAIM_MAP_VERSION)?;

        writer.write_varint(self.segments.len() as u64)?;
        for segment in &self.segments {
            writer.write_u32(segment.segment_id)?;
            writer.write_u32(segment.base_doc_id)?;
            writer.write_u32(segment.doc_count)?;
        }

        writer.write_varint(self.target_doc_counts.len() as u64)?;
        for &count in &self.target_doc_counts {
            writer.write_u32(count)?;
        }

        // 0 marks a dropped document, otherwise new id + 1.
        for &new_id in &self.old_to_new {
            let encoded = if new_id == DELETED { 0 } else { new_id as u64 + 1 };
            writer.write_varint(encoded)?;
        }
        writer.close()?;
        storage.rename_file(&temp_name, name)
    }

    /// Load a persisted map, validating that it is a bijection onto `[0, N)`.
    pub fn load(storage: &dyn Storage, name: &str) -> Result<Self> {
        let input = storage.open_input(name)?;
        let mut reader = StructReader::open(input)?;
        reader.expect_header(RECLAIM_MAP_MAGIC, RECLAIM_MAP_VERSION)?;

        let segment_count = reader.read_varint()? as usize;
        let mut infos = Vec::with_capacity(segment_count.min(1024));
        for _ in 0..segment_count {
            let segment_id = reader.read_u32()?;
            let base_doc_id = reader.read_u32()?;
            let doc_count = reader.read_u32()?;
            infos.push(SegmentMergeInfo::new(segment_id, base_doc_id, doc_count, 0));
        }

        let target_count = reader.read_varint()? as usize;
        let mut target_doc_counts = Vec::with_capacity(target_count.min(1024));
        for _ in 0..target_count {
            target_doc_counts.push(reader.read_u32()?);
        }

        let mut builder = ReclaimMapBuilder::new(&infos, target_count.max(1))
            .map_err(|e| MergeError::corrupt(format!("{name}: {e}")))?;
        let total: usize = infos.iter().map(|info| info.doc_count as usize).sum();
        let mut old_to_new = Vec::with_capacity(total);
        for _ in 0..total {
            let encoded = reader.read_varint()?;
            old_to_new.push(if encoded == 0 {
                DELETED
            } else {
                (encoded - 1) as DocId
            });
        }
        if !reader.is_eof() {
            return Err(MergeError::corrupt(format!("{name}: trailing bytes")));
        }

        let new_doc_count: u32 = target_doc_counts.iter().sum();
        let mut new_to_old = vec![DELETED; new_doc_count as usize];
        for (slot, &new_id) in old_to_new.iter().enumerate() {
            if new_id == DELETED {
                continue;
            }
            let old = builder.old_id_of_slot(slot);
            match new_to_old.get_mut(new_id as usize) {
                Some(entry) if *entry == DELETED => *entry = old,
                _ => {
                    return Err(MergeError::corrupt(format!(
                        "{name}: new doc id {new_id} out of range or assigned twice"
                    )));
                }
            }
        }
        if new_to_old.contains(&DELETED) {
            return Err(MergeError::corrupt(format!("{name}: new doc ids have gaps")));
        }

        builder.map.old_to_new = old_to_new;
        builder.map.new_to_old = new_to_old;
        builder.map.target_doc_counts = target_doc_counts;
        Ok(builder.map)
    }
}

/// Incremental construction of a [`ReclaimMap`].
///
/// Documents are assigned to targets in emission order; [`Self::build`]
/// numbers them target by target.
#[derive(Debug)]
pub struct ReclaimMapBuilder {
    map: ReclaimMap,
    target_docs: Vec<Vec<DocId>>,
}

impl ReclaimMapBuilder {
    /// Start a map over `segments` (in any order) with `target_count` outputs.
    pub fn new(segments: &[SegmentMergeInfo], target_count: usize) -> Result<Self> {
        if target_count == 0 {
            return Err(MergeError::logic("reclaim map needs at least one target"));
        }
        // Empty segments own no slots and would shadow neighbours sharing their base.
        let mut sorted: Vec<&SegmentMergeInfo> =
            segments.iter().filter(|info| info.doc_count > 0).collect();
        sorted.sort_by_key(|info| info.base_doc_id);

        let mut reclaim_segments = Vec::with_capacity(sorted.len());
        let mut offset = 0usize;
        let mut previous_end: Option<u64> = None;
        for info in sorted {
            let start = info.base_doc_id as u64;
            if previous_end.is_some_and(|end| start < end) {
                return Err(MergeError::logic(format!(
                    "segment {} overlaps the doc id range of another input",
                    info.segment_id
                )));
            }
            previous_end = Some(start + info.doc_count as u64);
            reclaim_segments.push(ReclaimSegment {
                segment_id: info.segment_id,
                base_doc_id: info.base_doc_id,
                doc_count: info.doc_count,
                offset,
            });
            offset += info.doc_count as usize;
        }

        Ok(ReclaimMapBuilder {
            map: ReclaimMap {
                segments: reclaim_segments,
                old_to_new: vec![DELETED; offset],
                new_to_old: Vec::new(),
                target_doc_counts: Vec::new(),
            },
            target_docs: vec![Vec::new(); target_count],
        })
    }

    fn old_id_of_slot(&self, slot: usize) -> DocId {
        let idx = self
            .map
            .segments
            .partition_point(|segment| segment.offset <= slot)
            - 1;
        let segment = &self.map.segments[idx];
        segment.base_doc_id + (slot - segment.offset) as DocId
    }

    /// Retain `old_doc_id` in target `target_idx`, after everything already
    /// assigned to that target.
    pub fn assign(&mut self, old_doc_id: DocId, target_idx: usize) -> Result<()> {
        let slot = self.map.slot(old_doc_id).ok_or_else(|| {
            MergeError::logic(format!("doc {old_doc_id} is not in the merged segments"))
        })?;
        let target_count = self.target_docs.len();
        let docs = self.target_docs.get_mut(target_idx).ok_or_else(|| {
            MergeError::logic(format!(
                "target segment {target_idx} out of range (0..{target_count})"
            ))
        })?;
        if self.map.old_to_new[slot] != DELETED {
            return Err(MergeError::logic(format!("doc {old_doc_id} assigned twice")));
        }
        // Temporary marker until build() numbers the targets.
        self.map.old_to_new[slot] = 0;
        docs.push(old_doc_id);
        Ok(())
    }

    pub fn build(mut self) -> ReclaimMap {
        let mut new_id: DocId = 0;
        let mut new_to_old = Vec::new();
        let mut target_doc_counts = Vec::with_capacity(self.target_docs.len());
        for docs in std::mem::take(&mut self.target_docs) {
            target_doc_counts.push(docs.len() as u32);
            for old in docs {
                if let Some(slot) = self.map.slot(old) {
                    self.map.old_to_new[slot] = new_id;
                }
                new_to_old.push(old);
                new_id += 1;
            }
        }
        self.map.new_to_old = new_to_old;
        self.map.target_doc_counts = target_doc_counts;
        self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn two_segments() -> Vec<SegmentMergeInfo> {
        vec![
            SegmentMergeInfo::new(0, 0, 3, 0),
            SegmentMergeInfo::new(1, 10, 2, 0),
        ]
    }

    #[test]
    fn test_builder_numbers_targets_in_order() {
        let mut builder = ReclaimMapBuilder::new(&two_segments(), 2).unwrap();
        builder.assign(10, 1).unwrap();
        builder.assign(0, 0).unwrap();
        builder.assign(2, 1).unwrap();
        builder.assign(11, 0).unwrap();
        let map = builder.build();

        assert_eq!(map.new_doc_count(), 4);
        assert_eq!(map.deleted_doc_count(), 1);
        assert_eq!(map.target_doc_counts(), &[2, 2]);
        assert_eq!(map.target_base_doc_ids(), vec![0, 2]);
        assert_eq!(map.get_new_id(0), Some(0));
        assert_eq!(map.get_new_id(11), Some(1));
        assert_eq!(map.get_new_id(10), Some(2));
        assert_eq!(map.get_new_id(2), Some(3));
        assert!(map.is_deleted(1));
        assert_eq!(map.get_new_id(1), None);
        assert_eq!(map.get_new_id(5), None);
        assert!(!map.contains(5));
        assert_eq!(map.get_old_id(2), Some(10));
        assert_eq!(map.target_of(3), Some((1, 1)));
        assert_eq!(map.target_range(1), Some(2..4));
        assert_eq!(map.locate_old(11), Some((1, 1)));
    }

    #[test]
    fn test_assign_errors() {
        let mut builder = ReclaimMapBuilder::new(&two_segments(), 1).unwrap();
        assert!(matches!(builder.assign(5, 0), Err(MergeError::Logic(_))));
        assert!(matches!(builder.assign(0, 1), Err(MergeError::Logic(_))));
        builder.assign(0, 0).unwrap();
        assert!(matches!(builder.assign(0, 0), Err(MergeError::Logic(_))));
    }

    #[test]
    fn test_overlapping_segments_rejected() {
        let segments = vec![
            SegmentMergeInfo::new(0, 0, 5, 0),
            SegmentMergeInfo::new(1, 4, 5, 0),
        ];
        assert!(ReclaimMapBuilder::new(&segments, 1).is_err());
    }

    #[test]
    fn test_iter_in_old_order() {
        let mut builder = ReclaimMapBuilder::new(&two_segments(), 1).unwrap();
        builder.assign(11, 0).unwrap();
        builder.assign(0, 0).unwrap();
        let pairs: Vec<_> = builder.build().iter().collect();
        assert_eq!(
            pairs,
            vec![
                (0, Some(1)),
                (1, None),
                (2, None),
                (10, None),
                (11, Some(0))
            ]
        );
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new();
        let mut builder = ReclaimMapBuilder::new(&two_segments(), 2).unwrap();
        for (old, target) in [(0, 0), (2, 0), (10, 1), (11, 1)] {
            builder.assign(old, target).unwrap();
        }
        let map = builder.build();
        let name = ReclaimMap::file_name(3);
        map.store(&storage, &name).unwrap();

        assert_eq!(name, "merge_meta/MergePlan_3.reclaim_map");
        assert!(!storage.file_exists(&format!("{name}.tmp")));
        assert_eq!(ReclaimMap::load(&storage, &name).unwrap(), map);
    }

    #[test]
    fn test_load_rejects_corruption() {
        let storage = MemoryStorage::new();
        let mut builder = ReclaimMapBuilder::new(&two_segments(), 1).unwrap();
        builder.assign(0, 0).unwrap();
        builder.build().store(&storage, "map").unwrap();

        let mut data = storage.read_all("map").unwrap();
        let last = data.len() - 5;
        data[last] ^= 0x40;
        storage.replace_bytes("map", data);
        assert!(matches!(
            ReclaimMap::load(&storage, "map"),
            Err(MergeError::CorruptData(_))
        ));
    }

    #[test]
    fn test_empty_map() {
        let builder = ReclaimMapBuilder::new(&[], 1).unwrap();
        let map = builder.build();
        assert!(map.is_empty());
        assert_eq!(map.new_doc_count(), 0);
        assert_eq!(map.target_doc_counts(), &[0]);
    }
}
