//! Grouping of segment primary key data into budgeted load plans.

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::segment::{DeletionMapReader, DocId, SegmentId, SegmentInfo};

/// A run of consecutive segments whose primary keys are served by one lookup
/// structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyLoadPlan {
    pub base_doc_id: DocId,
    pub doc_count: u32,
    pub deleted_doc_count: u32,
    pub segment_ids: Vec<SegmentId>,
}

impl PrimaryKeyLoadPlan {
    fn start(segment: &SegmentInfo, deleted: u32) -> Self {
        PrimaryKeyLoadPlan {
            base_doc_id: segment.base_doc_id,
            doc_count: segment.doc_count,
            deleted_doc_count: deleted,
            segment_ids: vec![segment.segment_id],
        }
    }

    fn push(&mut self, segment: &SegmentInfo, deleted: u32) {
        self.doc_count += segment.doc_count;
        self.deleted_doc_count += deleted;
        self.segment_ids.push(segment.segment_id);
    }

    pub fn live_doc_count(&self) -> u32 {
        self.doc_count - self.deleted_doc_count
    }

    pub fn end_doc_id(&self) -> DocId {
        self.base_doc_id + self.doc_count
    }

    pub fn contains(&self, doc_id: DocId) -> bool {
        doc_id >= self.base_doc_id && doc_id < self.end_doc_id()
    }
}

/// Decides how segment primary key data is grouped for loading.
pub trait PrimaryKeyLoadStrategy: Send + Sync + std::fmt::Debug {
    /// Plans in doc id order; every segment lands in exactly one plan.
    fn create_load_plans(
        &self,
        segments: &[SegmentInfo],
        deletions: &dyn DeletionMapReader,
    ) -> Result<Vec<PrimaryKeyLoadPlan>>;
}

/// Greedily combines consecutive segments while the plan stays within
/// `max_doc_count` documents. Offline segments come before realtime ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineSegmentsLoadStrategy {
    pub max_doc_count: u64,
    /// When false every segment gets its own plan.
    pub combine_segments: bool,
}

impl Default for CombineSegmentsLoadStrategy {
    fn default() -> Self {
        CombineSegmentsLoadStrategy {
            max_doc_count: u32::MAX as u64,
            combine_segments: true,
        }
    }
}

impl CombineSegmentsLoadStrategy {
    pub fn new(max_doc_count: u64) -> Result<Self> {
        if max_doc_count == 0 {
            return Err(MergeError::configuration(
                "primary key max_doc_count must be positive",
            ));
        }
        Ok(CombineSegmentsLoadStrategy {
            max_doc_count,
            combine_segments: true,
        })
    }

    pub fn with_combine_segments(mut self, combine: bool) -> Self {
        self.combine_segments = combine;
        self
    }
}

impl PrimaryKeyLoadStrategy for CombineSegmentsLoadStrategy {
    fn create_load_plans(
        &self,
        segments: &[SegmentInfo],
        deletions: &dyn DeletionMapReader,
    ) -> Result<Vec<PrimaryKeyLoadPlan>> {
        let ordered = segments
            .iter()
            .filter(|s| !s.is_realtime)
            .chain(segments.iter().filter(|s| s.is_realtime));

        let mut plans: Vec<PrimaryKeyLoadPlan> = Vec::new();
        for segment in ordered {
            let deleted = deletions.deleted_doc_count(segment.segment_id);
            let joins_last = self.combine_segments
                && plans.last().is_some_and(|plan| {
                    plan.end_doc_id() == segment.base_doc_id
                        && plan.doc_count as u64 + segment.doc_count as u64 <= self.max_doc_count
                });
            match plans.last_mut() {
                Some(plan) if joins_last => plan.push(segment, deleted),
                _ => plans.push(PrimaryKeyLoadPlan::start(segment, deleted)),
            }
        }

        log::debug!(
            "{} primary key load plans over {} segments",
            plans.len(),
            segments.len()
        );
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{DeletionMap, NoDeletions};

    fn segments(counts: &[u32]) -> Vec<SegmentInfo> {
        let mut base = 0;
        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let mut info = SegmentInfo::new(i as u32, count);
                info.base_doc_id = base;
                base += count;
                info
            })
            .collect()
    }

    #[test]
    fn test_greedy_combination() {
        let strategy = CombineSegmentsLoadStrategy::new(4).unwrap();
        let plans = strategy
            .create_load_plans(&segments(&[3, 2, 2]), &NoDeletions)
            .unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].segment_ids, vec![0]);
        assert_eq!(plans[0].doc_count, 3);
        assert_eq!(plans[1].segment_ids, vec![1, 2]);
        assert_eq!(plans[1].base_doc_id, 3);
        assert_eq!(plans[1].doc_count, 4);
    }

    #[test]
    fn test_oversized_segment_gets_own_plan() {
        let strategy = CombineSegmentsLoadStrategy::new(4).unwrap();
        let plans = strategy
            .create_load_plans(&segments(&[1, 10, 1, 1]), &NoDeletions)
            .unwrap();
        let ids: Vec<_> = plans.iter().map(|p| p.segment_ids.clone()).collect();
        assert_eq!(ids, vec![vec![0], vec![1], vec![2, 3]]);
    }

    #[test]
    fn test_deleted_counts_recorded() {
        let infos = segments(&[2, 2]);
        let mut deletions = DeletionMap::new();
        deletions.add_segment(0, 0, 2);
        deletions.add_segment(1, 2, 2);
        deletions.delete(3).unwrap();
        let plans = CombineSegmentsLoadStrategy::default()
            .create_load_plans(&infos, &deletions)
            .unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].deleted_doc_count, 1);
        assert_eq!(plans[0].live_doc_count(), 3);
    }

    #[test]
    fn test_realtime_segments_not_combined_with_offline_gap() {
        let mut infos = segments(&[2, 2, 2]);
        infos[1].is_realtime = true;
        let plans = CombineSegmentsLoadStrategy::default()
            .create_load_plans(&infos, &NoDeletions)
            .unwrap();
        // Offline segments 0 and 2 are not adjacent in doc id space.
        let ids: Vec<_> = plans.iter().map(|p| p.segment_ids.clone()).collect();
        assert_eq!(ids, vec![vec![0], vec![2], vec![1]]);
    }

    #[test]
    fn test_no_combination() {
        let plans = CombineSegmentsLoadStrategy::default()
            .with_combine_segments(false)
            .create_load_plans(&segments(&[1, 1]), &NoDeletions)
            .unwrap();
        assert_eq!(plans.len(), 2);
        assert!(CombineSegmentsLoadStrategy::new(0).is_err());
    }
}
