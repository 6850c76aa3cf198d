//! Merge of an operator-chosen set of segments.

use crate::error::{MergeError, Result};
use crate::merge::config::MergeStrategyParameter;
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::strategy::{MergeStrategy, admit_plans, target_level};
use crate::resource::MergeResourceEstimator;
use crate::segment::{LevelInfo, SegmentId, SegmentMergeInfo};

#[derive(Debug, Clone, Default)]
pub struct SpecificSegmentsMergeStrategy {
    segment_ids: Vec<SegmentId>,
    params: MergeStrategyParameter,
    estimator: Option<MergeResourceEstimator>,
}

impl SpecificSegmentsMergeStrategy {
    pub fn new(segment_ids: Vec<SegmentId>) -> Self {
        SpecificSegmentsMergeStrategy {
            segment_ids,
            ..Default::default()
        }
    }

    pub fn with_estimator(mut self, estimator: Option<MergeResourceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }
}

impl MergeStrategy for SpecificSegmentsMergeStrategy {
    fn name(&self) -> &'static str {
        "specific_segments"
    }

    fn set_parameter(&mut self, params: &MergeStrategyParameter) -> Result<()> {
        params.validate()?;
        self.params = params.clone();
        Ok(())
    }

    fn create_merge_task(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        let mut selected = Vec::with_capacity(self.segment_ids.len());
        for id in &self.segment_ids {
            let segment = segments
                .iter()
                .find(|s| s.segment_id == *id)
                .ok_or_else(|| {
                    MergeError::configuration(format!("segment {id} is not in the current version"))
                })?;
            if !selected.iter().any(|s: &SegmentMergeInfo| s.segment_id == *id) {
                selected.push(*segment);
            }
        }
        if selected.is_empty() {
            return Ok(MergeTask::new());
        }

        let plan = MergePlan::new(selected);
        if plan.is_trivial() && self.params.skip_single_merged_segment {
            return Ok(MergeTask::new());
        }
        let level = target_level(&plan, level_info);
        Ok(admit_plans(vec![plan.with_target_level(level)], self.estimator.as_ref())
            .into_iter()
            .collect())
    }

    fn create_merge_task_for_optimize(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        self.create_merge_task(segments, level_info)
    }
}
