//! Balance-tree (tiered) merge strategy.
//!
//! Segments are bucketed into layers by live doc count: layer 0 holds
//! segments up to `base_doc_count` docs and every further layer is
//! `conflict_segment_count` times larger. Once a layer collects
//! `conflict_segment_count` segments they merge into one segment of a higher
//! layer, so each document is rewritten O(log N) times. Segments at or above
//! `max_doc_count` form the top layer and are only rewritten to purge
//! deletions: every deletion-heavy segment left over by the layer merges,
//! top layer included, is gathered into one dedicated plan.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::merge::config::MergeStrategyParameter;
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::strategy::{MergeStrategy, OptimizeMergeStrategy, admit_plans, target_level};
use crate::resource::MergeResourceEstimator;
use crate::segment::{LevelInfo, SegmentId, SegmentMergeInfo};

/// Tiered merge strategy inspired by LSM-trees.
#[derive(Debug, Clone, Default)]
pub struct BalanceTreeMergeStrategy {
    params: MergeStrategyParameter,
    estimator: Option<MergeResourceEstimator>,
}

impl BalanceTreeMergeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_estimator(mut self, estimator: Option<MergeResourceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn params(&self) -> &MergeStrategyParameter {
        &self.params
    }

    /// Layer of a segment with `live` documents.
    pub fn layer_of(&self, live: u64) -> u32 {
        let growth = self.params.conflict_segment_count as u64;
        let mut threshold = self.params.base_doc_count as u64;
        let mut layer = 0;
        while live > threshold {
            layer += 1;
            threshold = threshold.saturating_mul(growth);
        }
        layer
    }

    fn is_top_layer(&self, segment: &SegmentMergeInfo) -> bool {
        segment.live_doc_count() >= self.params.max_doc_count
    }

    fn exceeds_delete_percent(&self, segment: &SegmentMergeInfo) -> bool {
        segment.deleted_doc_count > 0
            && segment.deleted_doc_count as u64 * 100
                > self.params.conflict_delete_percent as u64 * segment.doc_count as u64
    }

    /// Smallest segments first while the merged output stays within
    /// `max_doc_count`.
    fn fit_max_doc_count(&self, mut candidates: Vec<SegmentMergeInfo>) -> Vec<SegmentMergeInfo> {
        candidates.sort_by_key(|s| (s.live_doc_count(), s.base_doc_id));
        let mut total = 0u64;
        candidates
            .into_iter()
            .take_while(|s| {
                total += s.live_doc_count() as u64;
                total <= self.params.max_doc_count as u64
            })
            .collect()
    }

    /// Leftover segments whose deleted share exceeds
    /// `conflict_delete_percent`, smallest first while the output stays
    /// within `max_doc_count`. The first one is always taken.
    fn top_layer_plan(
        &self,
        segments: &[SegmentMergeInfo],
        used: &mut HashSet<SegmentId>,
    ) -> Option<MergePlan> {
        let mut eligible: Vec<SegmentMergeInfo> = segments
            .iter()
            .filter(|s| {
                !used.contains(&s.segment_id)
                    && s.live_doc_count() <= self.params.max_valid_doc_count
                    && self.exceeds_delete_percent(s)
            })
            .copied()
            .collect();
        eligible.sort_by_key(|s| (s.live_doc_count(), s.base_doc_id));

        let mut selected: Vec<SegmentMergeInfo> = Vec::new();
        let mut total = 0u64;
        for segment in eligible {
            let live = segment.live_doc_count() as u64;
            if !selected.is_empty() && total + live > self.params.max_doc_count as u64 {
                break;
            }
            log::debug!(
                "segment {} has {:.1}% deleted docs, rewriting",
                segment.segment_id,
                segment.deletion_ratio() * 100.0
            );
            total += live;
            selected.push(segment);
        }
        if selected.is_empty() {
            return None;
        }
        used.extend(selected.iter().map(|s| s.segment_id));
        Some(MergePlan::new(selected))
    }

    fn layer_plans(
        &self,
        layers: &BTreeMap<u32, Vec<SegmentMergeInfo>>,
        used: &mut HashSet<SegmentId>,
    ) -> Vec<MergePlan> {
        let conflict = self.params.conflict_segment_count as usize;
        let max = self.params.max_doc_count as u64;
        let layer_ids: Vec<u32> = layers.keys().copied().collect();
        let unused = |layer: u32, used: &HashSet<SegmentId>| -> Vec<SegmentMergeInfo> {
            layers[&layer]
                .iter()
                .filter(|s| !used.contains(&s.segment_id))
                .copied()
                .collect()
        };

        let mut plans = Vec::new();
        for (pos, &layer) in layer_ids.iter().enumerate() {
            let candidates = unused(layer, &*used);
            if candidates.len() < conflict {
                continue;
            }
            let mut selected = self.fit_max_doc_count(candidates);
            if selected.len() < 2 {
                continue;
            }
            let mut total: u64 = selected.iter().map(|s| s.live_doc_count() as u64).sum();

            // The output may complete a conflict on the layer it lands in.
            let mut out_layer = self.layer_of(total);
            for &higher in &layer_ids[pos + 1..] {
                if higher > out_layer {
                    break;
                }
                if higher < out_layer {
                    continue;
                }
                let others = unused(higher, &*used);
                let extra: u64 = others.iter().map(|s| s.live_doc_count() as u64).sum();
                if others.len() + 1 < conflict || total + extra > max {
                    break;
                }
                log::debug!(
                    "layer {layer} merge absorbs {} segments of layer {higher}",
                    others.len()
                );
                selected.extend(others);
                total += extra;
                out_layer = self.layer_of(total);
            }

            used.extend(selected.iter().map(|s| s.segment_id));
            plans.push(MergePlan::new(selected));
        }
        plans
    }
}

impl MergeStrategy for BalanceTreeMergeStrategy {
    fn name(&self) -> &'static str {
        "balance_tree"
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
        let mut layers: BTreeMap<u32, Vec<SegmentMergeInfo>> = BTreeMap::new();
        for segment in segments.iter().filter(|s| !self.is_top_layer(s)) {
            layers
                .entry(self.layer_of(segment.live_doc_count() as u64))
                .or_default()
                .push(*segment);
        }

        let mut used = HashSet::new();
        let mut plans = self.layer_plans(&layers, &mut used);

        plans.extend(self.top_layer_plan(segments, &mut used));

        let plans = plans
            .into_iter()
            .filter(|plan| !plan.is_trivial())
            .map(|plan| {
                let level = target_level(&plan, level_info);
                plan.with_target_level(level)
            })
            .collect();
        let task: MergeTask = admit_plans(plans, self.estimator.as_ref())
            .into_iter()
            .collect();

        log::info!(
            "balance tree planned {} merges over {} segments",
            task.len(),
            segments.len()
        );
        Ok(task)
    }

    fn create_merge_task_for_optimize(
        &self,
        segments: &[SegmentMergeInfo],
        level_info: &LevelInfo,
    ) -> Result<MergeTask> {
        let mut optimize = OptimizeMergeStrategy::new().with_estimator(self.estimator.clone());
        optimize.set_parameter(&self.params)?;
        optimize.create_merge_task_for_optimize(segments, level_info)
    }
}
