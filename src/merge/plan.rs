//! Merge plans and tasks.

use serde::{Deserialize, Serialize};

use crate::segment::{SegmentId, SegmentMergeInfo};

/// Segments that merge into one or more target segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    /// Position of the plan in its task.
    pub plan_id: usize,
    /// Input segments in doc id order.
    pub segments: Vec<SegmentMergeInfo>,
    /// Level the merged segments join.
    #[serde(default)]
    pub target_level: u32,
    /// Number of output segments.
    #[serde(default = "default_target_count")]
    pub target_segment_count: usize,
    /// Ids of the output segments, assigned when the task is prepared.
    #[serde(default)]
    pub target_segment_ids: Vec<SegmentId>,
}

fn default_target_count() -> usize {
    1
}

impl MergePlan {
    pub fn new(mut segments: Vec<SegmentMergeInfo>) -> Self {
        segments.sort_by_key(|s| s.base_doc_id);
        MergePlan {
            plan_id: 0,
            segments,
            target_level: 0,
            target_segment_count: 1,
            target_segment_ids: Vec::new(),
        }
    }

    pub fn with_target_level(mut self, level: u32) -> Self {
        self.target_level = level;
        self
    }

    pub fn with_target_segment_count(mut self, count: usize) -> Self {
        self.target_segment_count = count.max(1);
        self
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.iter().map(|s| s.segment_id).collect()
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.segments.iter().any(|s| s.segment_id == segment_id)
    }

    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count as u64).sum()
    }

    pub fn live_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.live_doc_count() as u64).sum()
    }

    pub fn deleted_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.deleted_doc_count as u64).sum()
    }

    pub fn total_segment_size(&self) -> u64 {
        self.segments.iter().map(|s| s.segment_size).sum()
    }

    /// Output segment id of a target, once assigned.
    pub fn target_segment_id(&self, target_idx: usize) -> Option<SegmentId> {
        self.target_segment_ids.get(target_idx).copied()
    }

    /// A single deletion-free input merged into one target changes nothing.
    pub fn is_trivial(&self) -> bool {
        self.segments.len() == 1
            && self.segments[0].deleted_doc_count == 0
            && self.target_segment_count == 1
    }

    /// Split into two plans of consecutive inputs. `None` for single inputs.
    ///
    /// Each half keeps the live docs per output segment of the whole plan,
    /// so its target count shrinks with its share of the documents.
    pub fn split_in_half(&self) -> Option<(MergePlan, MergePlan)> {
        if self.segments.len() < 2 {
            return None;
        }
        let targets = self.target_segment_count.max(1);
        let per_target = self.live_doc_count().div_ceil(targets as u64).max(1);
        let mid = self.segments.len() / 2;
        let mut left = self.clone();
        let mut right = self.clone();
        left.segments.truncate(mid);
        right.segments.drain(..mid);
        for half in [&mut left, &mut right] {
            let needed = half.live_doc_count().div_ceil(per_target).max(1);
            half.target_segment_count = (needed as usize).min(targets);
            half.target_segment_ids.clear();
        }
        Some((left, right))
    }
}

/// Ordered plans produced by one strategy run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeTask {
    plans: Vec<MergePlan>,
}

impl MergeTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plan, assigning its id.
    pub fn add_plan(&mut self, mut plan: MergePlan) {
        plan.plan_id = self.plans.len();
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[MergePlan] {
        &self.plans
    }

    pub fn plans_mut(&mut self) -> &mut [MergePlan] {
        &mut self.plans
    }

    pub fn plan(&self, plan_id: usize) -> Option<&MergePlan> {
        self.plans.get(plan_id)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Every input segment of every plan.
    pub fn merged_segment_ids(&self) -> Vec<SegmentId> {
        self.plans.iter().flat_map(|p| p.segment_ids()).collect()
    }
}

impl FromIterator<MergePlan> for MergeTask {
    fn from_iter<I: IntoIterator<Item = MergePlan>>(iter: I) -> Self {
        let mut task = MergeTask::new();
        for plan in iter {
            task.add_plan(plan);
        }
        task
    }
}
