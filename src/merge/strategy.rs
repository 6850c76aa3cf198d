//! Merge strategies.
//!
//! A strategy looks at the live segments of a Version and decides which of
//! them to merge. It only plans; nothing is read or written.
//!
//! - [`BalanceTreeMergeStrategy`]: tiered compaction by log-scaled layers.
//! - [`OptimizeMergeStrategy`]: full compaction with bounded output segments.
//! - [`SpecificSegmentsMergeStrategy`]: merges an explicit list of segments.

pub mod balance_tree;
pub mod optimize;
pub mod specific_segments;

pub use balance_tree::BalanceTreeMergeStrategy;
pub use optimize::OptimizeMergeStrategy;
pub use specific_segments::SpecificSegmentsMergeStrategy;

use crate::error::Result;
use crate::merge::config::{MergeConfig, MergeStrategyParameter, StrategyKind};
use crate::merge::plan::{MergePlan, MergeTask};
use crate::resource::MergeResourceEstimator;
use crate::segment::{LevelInfo, SegmentMergeInfo};

/// Trait for planning merges.
pub trait MergeStrategy: Send + Sync + std::fmt::Debug {
    /// Strategy name, as used in configuration.
    fn name(&self) -> &'static str;

    /// Apply parameters. Invalid parameters fail here, never later.
    fn set_parameter(&mut self, params: &MergeStrategyParameter) -> Result<()>;

    /// Plan a regular merge.
    fn create_merge_task(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask>;

    /// Plan a full compaction.
    fn create_merge_task_for_optimize(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask>;
}

/// Build the strategy named by a merge configuration.
pub fn create_strategy(
    config: &MergeConfig,
    estimator: Option<MergeResourceEstimator>,
) -> Result<Box<dyn MergeStrategy>> {
    let params = config.strategy_parameter()?;
    let mut strategy: Box<dyn MergeStrategy> = match config.strategy {
        StrategyKind::BalanceTree => {
            Box::new(BalanceTreeMergeStrategy::new().with_estimator(estimator))
        }
        StrategyKind::Optimize => Box::new(OptimizeMergeStrategy::new().with_estimator(estimator)),
        StrategyKind::SpecificSegments => Box::new(
            SpecificSegmentsMergeStrategy::new(config.specific_segments.clone())
                .with_estimator(estimator),
        ),
    };
    strategy.set_parameter(&params)?;
    Ok(strategy)
}

/// Level merged output lands on: one below the deepest input, bounded by
/// the deepest existing level.
pub(crate) fn target_level(plan: &MergePlan, level_info: &LevelInfo) -> u32 {
    let deepest_input = plan
        .segments
        .iter()
        .filter_map(|s| level_info.level_of(s.segment_id))
        .max()
        .unwrap_or(0);
    let last_level = level_info.level_count().saturating_sub(1);
    (deepest_input + 1).min(last_level)
}

/// Check plans against the resource quota, counting the plans that run
/// side by side together. Oversized plans are split in halves until they
/// fit; halves that would change nothing and single-segment plans that
/// still do not fit are dropped.
pub(crate) fn admit_plans(
    plans: Vec<MergePlan>,
    estimator: Option<&MergeResourceEstimator>,
) -> Vec<MergePlan> {
    let Some(estimator) = estimator else {
        return plans;
    };

    let mut admitted = Vec::new();
    let mut estimates = Vec::new();
    let mut pending = plans;
    pending.reverse();
    while let Some(plan) = pending.pop() {
        let checked = estimator.check(&plan).and_then(|estimate| {
            estimates.push(estimate);
            let concurrent = estimator.check_concurrent(&estimates);
            if concurrent.is_err() {
                estimates.pop();
            }
            concurrent
        });
        match checked {
            Ok(()) => admitted.push(plan),
            Err(e) => match plan.split_in_half() {
                Some((left, right)) => {
                    log::warn!(
                        "splitting plan over segments {:?}: {e}",
                        plan.segment_ids()
                    );
                    for half in [right, left] {
                        if half.is_trivial() {
                            log::debug!("dropping no-op half over segments {:?}", half.segment_ids());
                        } else {
                            pending.push(half);
                        }
                    }
                }
                None => {
                    log::warn!("rejecting plan over segments {:?}: {e}", plan.segment_ids());
                }
            },
        }
    }
    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceQuota;

    fn segments(count: u32, docs: u32) -> Vec<SegmentMergeInfo> {
        (0..count)
            .map(|i| SegmentMergeInfo::new(i, i * docs, docs, 0))
            .collect()
    }

    #[test]
    fn test_admit_plans_splits_oversized() {
        // 8 bytes per doc of reclaim map; 100 docs per segment.
        let estimator = MergeResourceEstimator::new(ResourceQuota {
            max_memory_bytes: Some(1700),
            max_disk_bytes: None,
        });
        let plan = MergePlan::new(segments(4, 100));
        let admitted = admit_plans(vec![plan], Some(&estimator));
        let ids: Vec<_> = admitted.iter().map(|p| p.segment_ids()).collect();
        assert_eq!(ids, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_admit_plans_rejects_unsplittable() {
        let estimator = MergeResourceEstimator::new(ResourceQuota {
            max_memory_bytes: Some(10),
            max_disk_bytes: None,
        });
        let plan = MergePlan::new(segments(1, 100));
        assert!(admit_plans(vec![plan], Some(&estimator)).is_empty());
    }

    #[test]
    fn test_admit_plans_counts_concurrent_plans() {
        // Each two-segment plan needs 1600 bytes; two of them do not fit at once.
        let quota = ResourceQuota {
            max_memory_bytes: Some(2400),
            max_disk_bytes: None,
        };
        let all = segments(6, 100);
        let plans = || {
            vec![
                MergePlan::new(all[..2].to_vec()),
                MergePlan::new(all[2..].to_vec()),
            ]
        };

        let serial = MergeResourceEstimator::new(quota);
        let ids: Vec<_> = admit_plans(plans(), Some(&serial))
            .iter()
            .map(|p| p.segment_ids())
            .collect();
        assert_eq!(ids, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);

        let parallel = MergeResourceEstimator::new(quota).with_concurrency(2);
        let ids: Vec<_> = admit_plans(plans(), Some(&parallel))
            .iter()
            .map(|p| p.segment_ids())
            .collect();
        assert_eq!(ids, vec![vec![0, 1]]);
    }

    #[test]
    fn test_admit_plans_keeps_split_targets() {
        let estimator = MergeResourceEstimator::new(ResourceQuota {
            max_memory_bytes: Some(1700),
            max_disk_bytes: None,
        });
        let plan = MergePlan::new(segments(4, 100)).with_target_segment_count(4);
        let admitted = admit_plans(vec![plan], Some(&estimator));
        let counts: Vec<_> = admitted.iter().map(|p| p.target_segment_count).collect();
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn test_create_strategy_by_kind() {
        let mut config = MergeConfig::default();
        assert_eq!(create_strategy(&config, None).unwrap().name(), "balance_tree");
        config.strategy = StrategyKind::Optimize;
        assert_eq!(create_strategy(&config, None).unwrap().name(), "optimize");
        config.strategy = StrategyKind::SpecificSegments;
        config.specific_segments = vec![1];
        assert_eq!(
            create_strategy(&config, None).unwrap().name(),
            "specific_segments"
        );
        config.strategy_params = "conflict_segment_count=0".to_string();
        assert!(create_strategy(&config, None).is_err());
    }

    #[test]
    fn test_target_level() {
        let mut levels = LevelInfo::new(3);
        levels.add_segment(0, 0);
        levels.add_segment(1, 1);
        levels.add_segment(2, 2);
        let all = segments(3, 10);
        assert_eq!(target_level(&MergePlan::new(all[..1].to_vec()), &levels), 1);
        assert_eq!(target_level(&MergePlan::new(all[..2].to_vec()), &levels), 2);
        assert_eq!(target_level(&MergePlan::new(all.clone()), &levels), 2);
        assert_eq!(target_level(&MergePlan::new(all), &LevelInfo::new(1)), 0);
    }
}
