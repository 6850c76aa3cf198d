//! Optimize (full compaction) merge strategy.

use crate::error::Result;
use crate::merge::config::MergeStrategyParameter;
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::strategy::{MergeStrategy, admit_plans};
use crate::resource::MergeResourceEstimator;
use crate::segment::{LevelInfo, SegmentMergeInfo};

/// Merges every segment below `max_doc_count` into as few segments as the
/// output limits allow.
#[derive(Debug, Clone, Default)]
pub struct OptimizeMergeStrategy {
    params: MergeStrategyParameter,
    estimator: Option<MergeResourceEstimator>,
}

impl OptimizeMergeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_estimator(mut self, estimator: Option<MergeResourceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Output segments needed for `live_docs` documents.
    pub fn target_segment_count(&self, live_docs: u64) -> usize {
        let per_segment = self.params.after_merge_max_doc_count as u64;
        let needed = live_docs.div_ceil(per_segment).max(1);
        needed.min(self.params.after_merge_max_segment_count as u64) as usize
    }
}

impl MergeStrategy for OptimizeMergeStrategy {
    fn name(&self) -> &'static str {
        "optimize"
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
        self.create_merge_task_for_optimize(segments, level_info)
    }

    fn create_merge_task_for_optimize(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        let candidates: Vec<SegmentMergeInfo> = segments
            .iter()
            .filter(|s| s.live_doc_count() < self.params.max_doc_count)
            .copied()
            .collect();

        if candidates.is_empty() {
            log::info!("optimize: no segment below max_doc_count, nothing to merge");
            return Ok(MergeTask::new());
        }
        if candidates.len() == 1
            && candidates[0].deleted_doc_count == 0
            && self.params.skip_single_merged_segment
        {
            log::info!(
                "optimize: segment {} is already optimal",
                candidates[0].segment_id
            );
            return Ok(MergeTask::new());
        }

        let live: u64 = candidates.iter().map(|s| s.live_doc_count() as u64).sum();
        let target_count = self.target_segment_count(live);
        let plan = MergePlan::new(candidates)
            .with_target_level(level_info.level_count().saturating_sub(1))
            .with_target_segment_count(target_count);
        if target_count > 1 {
            log::info!("optimize: splitting {live} live docs into {target_count} segments");
        }

        let task: MergeTask = admit_plans(vec![plan], self.estimator.as_ref())
            .into_iter()
            .collect();
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(params: &str) -> OptimizeMergeStrategy {
        let mut strategy = OptimizeMergeStrategy::new();
        strategy
            .set_parameter(&MergeStrategyParameter::parse(params).unwrap())
            .unwrap();
        strategy
    }

    fn segments(specs: &[(u32, u32)]) -> Vec<SegmentMergeInfo> {
        let mut base = 0;
        specs
            .iter()
            .enumerate()
            .map(|(i, &(docs, deleted))| {
                let info = SegmentMergeInfo::new(i as u32, base, docs, deleted);
                base += docs;
                info
            })
            .collect()
    }

    #[test]
    fn test_merges_everything_below_max() {
        let task = strategy("max_doc_count=100")
            .create_merge_task_for_optimize(
                &segments(&[(10, 0), (500, 0), (20, 5)]),
                &LevelInfo::new(3),
            )
            .unwrap();
        assert_eq!(task.len(), 1);
        let plan = &task.plans()[0];
        assert_eq!(plan.segment_ids(), vec![0, 2]);
        assert_eq!(plan.target_level, 2);
        assert_eq!(plan.target_segment_count, 1);
    }

    #[test]
    fn test_single_optimal_segment_is_noop() {
        let single = segments(&[(10, 0)]);
        assert!(
            strategy("")
                .create_merge_task_for_optimize(&single, &LevelInfo::new(1))
                .unwrap()
                .is_empty()
        );

        let task = strategy("skip_single_merged_segment=false")
            .create_merge_task_for_optimize(&single, &LevelInfo::new(1))
            .unwrap();
        assert_eq!(task.len(), 1);
    }

    #[test]
    fn test_single_segment_with_deletions_is_merged() {
        let task = strategy("")
            .create_merge_task_for_optimize(&segments(&[(10, 3)]), &LevelInfo::new(1))
            .unwrap();
        assert_eq!(task.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(
            strategy("")
                .create_merge_task(&[], &LevelInfo::new(1))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_split_into_target_segments() {
        let task = strategy("after_merge_max_doc_count=25")
            .create_merge_task_for_optimize(
                &segments(&[(30, 0), (30, 0), (30, 0)]),
                &LevelInfo::new(1),
            )
            .unwrap();
        assert_eq!(task.plans()[0].target_segment_count, 4);

        let capped = strategy("after_merge_max_doc_count=25;after_merge_max_segment_count=2");
        assert_eq!(capped.target_segment_count(90), 2);
        assert_eq!(capped.target_segment_count(0), 1);
    }
}
