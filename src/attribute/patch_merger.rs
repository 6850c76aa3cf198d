//! Consolidation of patch generations at merge time.

use std::collections::BTreeMap;

use crate::attribute::patch::{PatchKind, PatchRecord, PatchTarget};
use crate::attribute::value::AttributeValue;
use crate::error::{MergeError, Result};
use crate::reclaim::ReclaimMap;
use crate::segment::{DocId, SegmentId, SegmentMergeInfo};
use crate::storage::Storage;

/// Latest patched values keyed by `(old global doc id, member index)`.
pub type PatchValues = BTreeMap<(DocId, u16), AttributeValue>;

/// Merges every patch generation of one attribute or pack across a plan's
/// input segments into one patch per output segment.
#[derive(Debug, Clone)]
pub struct PatchDedupMerger {
    kind: PatchKind,
    name: String,
    sub_segment: bool,
}

impl PatchDedupMerger {
    pub fn new(kind: PatchKind, name: impl Into<String>) -> Self {
        PatchDedupMerger {
            kind,
            name: name.into(),
            sub_segment: false,
        }
    }

    /// Merge the field of the sub documents instead.
    pub fn for_sub_segment(mut self) -> Self {
        self.sub_segment = true;
        self
    }

    fn target(&self, segment_id: SegmentId) -> PatchTarget {
        if self.sub_segment {
            PatchTarget::sub(self.kind, segment_id, &self.name)
        } else {
            PatchTarget::new(self.kind, segment_id, &self.name)
        }
    }

    /// Latest value of each patched (doc, member). Generations are applied
    /// oldest first, so the newest generation wins.
    pub fn collect(&self, storage: &dyn Storage, segments: &[SegmentMergeInfo]) -> Result<PatchValues> {
        let mut values = PatchValues::new();
        for segment in segments {
            let target = self.target(segment.segment_id);
            for generation in target.generations(storage)? {
                for record in target.read(storage, generation)? {
                    if record.doc_id >= segment.doc_count {
                        return Err(MergeError::corrupt(format!(
                            "{}: doc {} beyond segment of {} docs",
                            target.file_name(generation),
                            record.doc_id,
                            segment.doc_count
                        )));
                    }
                    values.insert((segment.base_doc_id + record.doc_id, record.field_idx), record.value);
                }
            }
        }
        Ok(values)
    }

    /// Records of one output segment, with doc ids local to it. Values of
    /// deleted documents are dropped.
    pub fn target_records(values: &PatchValues, reclaim_map: &ReclaimMap, target_idx: usize) -> Vec<PatchRecord> {
        values
            .iter()
            .filter_map(|(&(old, field_idx), value)| {
                let new = reclaim_map.get_new_id(old)?;
                let (target, local) = reclaim_map.target_of(new)?;
                (target == target_idx).then(|| PatchRecord::new(local, field_idx, value.clone()))
            })
            .collect()
    }

    /// Write the consolidated patch of one output segment as its generation 0.
    /// Returns the number of records; nothing is written when there are none.
    pub fn merge_target(
        &self,
        storage: &dyn Storage,
        segments: &[SegmentMergeInfo],
        reclaim_map: &ReclaimMap,
        target_idx: usize,
        target_segment_id: SegmentId,
    ) -> Result<usize> {
        let values = self.collect(storage, segments)?;
        let records = Self::target_records(&values, reclaim_map, target_idx);
        if records.is_empty() {
            return Ok(0);
        }
        let output = self.target(target_segment_id);
        let written = output.write(storage, 0, records)?;
        log::debug!(
            "consolidated {} patches of {} '{}' into segment {target_segment_id}",
            written,
            self.kind,
            self.name
        );
        Ok(written)
    }

    /// [`Self::merge_target`] for every output segment.
    pub fn merge(
        &self,
        storage: &dyn Storage,
        segments: &[SegmentMergeInfo],
        reclaim_map: &ReclaimMap,
        target_segment_ids: &[SegmentId],
    ) -> Result<usize> {
        if target_segment_ids.len() != reclaim_map.target_segment_count() {
            return Err(MergeError::logic(format!(
                "{} target segment ids for {} targets",
                target_segment_ids.len(),
                reclaim_map.target_segment_count()
            )));
        }
        let values = self.collect(storage, segments)?;
        let mut total = 0;
        for (idx, &segment_id) in target_segment_ids.iter().enumerate() {
            let records = Self::target_records(&values, reclaim_map, idx);
            if !records.is_empty() {
                total += self.target(segment_id).write(storage, 0, records)?;
            }
        }
        Ok(total)
    }
}
