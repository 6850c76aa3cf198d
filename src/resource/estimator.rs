//! Memory and disk estimates for planned merges.

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::merge::MergePlan;
use crate::resource::metrics::ResourceSnapshot;
use crate::segment::SegmentDirectory;

/// Upper bounds a single merge plan must respect. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceQuota {
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    #[serde(default)]
    pub max_disk_bytes: Option<u64>,
}

impl ResourceQuota {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_memory_bytes.is_none() && self.max_disk_bytes.is_none()
    }
}

/// Peak memory of a build that dumps with `dump_thread_count` threads.
///
/// Every component holds its current memory and grows by its dump expansion;
/// on top of that, the `dump_thread_count` largest dump scratch buffers may
/// be live at the same time.
pub fn estimate_max_memory_use(snapshots: &[ResourceSnapshot], dump_thread_count: usize) -> u64 {
    let current: u64 = snapshots.iter().map(|s| s.current_memory_use).sum();
    let expand: u64 = snapshots.iter().map(|s| s.dump_expand_memory_size).sum();

    let mut temps: Vec<u64> = snapshots.iter().map(|s| s.dump_temp_memory_size).collect();
    temps.sort_unstable_by(|a, b| b.cmp(a));
    let temp: u64 = temps.iter().take(dump_thread_count.max(1)).sum();

    current + expand + temp
}

/// Bytes that must be loaded when switching from `current` to `next`:
/// the size of every segment `next` has and `current` does not.
pub fn calculate_diff_version_lock_size(current: &SegmentDirectory, next: &SegmentDirectory) -> u64 {
    next.segments()
        .iter()
        .filter(|segment| current.segment(segment.segment_id).is_none())
        .map(|segment| segment.size_bytes)
        .sum()
}

/// Projected footprint of one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanResourceEstimate {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

/// Estimates plan footprints and checks them against a quota.
#[derive(Debug, Clone)]
pub struct MergeResourceEstimator {
    quota: ResourceQuota,
    /// Memory already committed by the running build.
    base_memory_bytes: u64,
    /// Plans that may run at the same time.
    concurrency: usize,
    /// Bytes per doc of the reclaim map (both directions).
    reclaim_bytes_per_doc: u64,
    /// Bytes per doc and sort field for sorted merges.
    sort_key_bytes_per_field: u64,
    sort_field_count: usize,
    /// Share of the input size held in memory by merge buffers.
    buffer_ratio: f64,
}

impl MergeResourceEstimator {
    pub fn new(quota: ResourceQuota) -> Self {
        MergeResourceEstimator {
            quota,
            base_memory_bytes: 0,
            concurrency: 1,
            reclaim_bytes_per_doc: 8,
            sort_key_bytes_per_field: 16,
            sort_field_count: 0,
            buffer_ratio: 0.1,
        }
    }

    pub fn with_base_memory(mut self, bytes: u64) -> Self {
        self.base_memory_bytes = bytes;
        self
    }

    /// Memory held by the build itself, as estimated from its metrics with
    /// [`estimate_max_memory_use`].
    pub fn with_build_snapshots(self, snapshots: &[ResourceSnapshot], dump_thread_count: usize) -> Self {
        self.with_base_memory(estimate_max_memory_use(snapshots, dump_thread_count))
    }

    /// Number of plans executed side by side.
    pub fn with_concurrency(mut self, plans: usize) -> Self {
        self.concurrency = plans.max(1);
        self
    }

    pub fn base_memory(&self) -> u64 {
        self.base_memory_bytes
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn with_sort_field_count(mut self, count: usize) -> Self {
        self.sort_field_count = count;
        self
    }

    pub fn with_buffer_ratio(mut self, ratio: f64) -> Self {
        self.buffer_ratio = ratio.max(0.0);
        self
    }

    pub fn quota(&self) -> &ResourceQuota {
        &self.quota
    }

    /// Footprint of `plan` alone, without the base memory.
    pub fn estimate(&self, plan: &MergePlan) -> PlanResourceEstimate {
        let total_docs = plan.total_doc_count();
        let live_docs = plan.live_doc_count();
        let input_size = plan.total_segment_size();

        let reclaim = total_docs * self.reclaim_bytes_per_doc;
        let sort_keys = live_docs * self.sort_key_bytes_per_field * self.sort_field_count as u64;
        let buffers = (input_size as f64 * self.buffer_ratio) as u64;

        let disk = if total_docs == 0 {
            0
        } else {
            (input_size as u128 * live_docs as u128 / total_docs as u128) as u64
        };

        PlanResourceEstimate {
            memory_bytes: reclaim + sort_keys + buffers,
            disk_bytes: disk,
        }
    }

    pub fn fits(&self, plan: &MergePlan) -> bool {
        self.check(plan).is_ok()
    }

    /// Estimate and fail with `ResourceExceeded` when the plan alone, on top
    /// of the base memory, is over quota.
    pub fn check(&self, plan: &MergePlan) -> Result<PlanResourceEstimate> {
        let estimate = self.estimate(plan);
        if let Some(max) = self.quota.max_memory_bytes {
            let peak = self.base_memory_bytes + estimate.memory_bytes;
            if peak > max {
                return Err(MergeError::resource_exceeded(format!(
                    "plan {} needs {peak} bytes of memory, quota is {max}",
                    plan.plan_id
                )));
            }
        }
        if let Some(max) = self.quota.max_disk_bytes
            && estimate.disk_bytes > max
        {
            return Err(MergeError::resource_exceeded(format!(
                "plan {} needs {} bytes of disk, quota is {max}",
                plan.plan_id, estimate.disk_bytes
            )));
        }
        Ok(estimate)
    }

    /// Peak memory of running plans with these estimates: the base memory
    /// plus the `concurrency` largest plans.
    pub fn peak_memory(&self, estimates: &[PlanResourceEstimate]) -> u64 {
        let mut memory: Vec<u64> = estimates.iter().map(|e| e.memory_bytes).collect();
        memory.sort_unstable_by(|a, b| b.cmp(a));
        self.base_memory_bytes + memory.iter().take(self.concurrency).sum::<u64>()
    }

    /// Check plans that run as one task. Every plan writes its output before
    /// the task commits, so disk adds up over all of them.
    pub fn check_concurrent(&self, estimates: &[PlanResourceEstimate]) -> Result<()> {
        if let Some(max) = self.quota.max_memory_bytes {
            let peak = self.peak_memory(estimates);
            if peak > max {
                return Err(MergeError::resource_exceeded(format!(
                    "{} plans on {} threads need {peak} bytes of memory, quota is {max}",
                    estimates.len(),
                    self.concurrency
                )));
            }
        }
        if let Some(max) = self.quota.max_disk_bytes {
            let disk: u64 = estimates.iter().map(|e| e.disk_bytes).sum();
            if disk > max {
                return Err(MergeError::resource_exceeded(format!(
                    "{} plans need {disk} bytes of disk, quota is {max}",
                    estimates.len()
                )));
            }
        }
        Ok(())
    }

    /// [`Self::check`] every plan, then [`Self::check_concurrent`] them.
    pub fn check_plans(&self, plans: &[MergePlan]) -> Result<Vec<PlanResourceEstimate>> {
        let estimates = plans
            .iter()
            .map(|plan| self.check(plan))
            .collect::<Result<Vec<_>>>()?;
        self.check_concurrent(&estimates)?;
        Ok(estimates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{CatalogSegment, SegmentCatalog, SegmentMergeInfo};

    fn plan(sizes: &[(u32, u32, u64)]) -> MergePlan {
        let mut base = 0;
        let segments = sizes
            .iter()
            .enumerate()
            .map(|(i, &(docs, deleted, size))| {
                let mut info = SegmentMergeInfo::new(i as u32, base, docs, deleted);
                info.segment_size = size;
                base += docs;
                info
            })
            .collect();
        MergePlan::new(segments)
    }

    #[test]
    fn test_estimate_max_memory_use_takes_top_temps() {
        let snapshots = [
            ResourceSnapshot {
                current_memory_use: 100,
                dump_temp_memory_size: 50,
                dump_expand_memory_size: 10,
                dump_file_size: 0,
            },
            ResourceSnapshot {
                current_memory_use: 10,
                dump_temp_memory_size: 70,
                dump_expand_memory_size: 0,
                dump_file_size: 0,
            },
            ResourceSnapshot {
                current_memory_use: 0,
                dump_temp_memory_size: 20,
                dump_expand_memory_size: 5,
                dump_file_size: 0,
            },
        ];
        assert_eq!(estimate_max_memory_use(&snapshots, 1), 125 + 70);
        assert_eq!(estimate_max_memory_use(&snapshots, 2), 125 + 120);
        assert_eq!(estimate_max_memory_use(&snapshots, 10), 125 + 140);
        assert_eq!(estimate_max_memory_use(&[], 4), 0);
    }

    #[test]
    fn test_plan_estimate() {
        let estimator = MergeResourceEstimator::new(ResourceQuota::unlimited())
            .with_sort_field_count(1)
            .with_buffer_ratio(0.5);
        let estimate = estimator.estimate(&plan(&[(100, 50, 1000), (100, 0, 1000)]));
        // reclaim 200 * 8, sort keys 150 * 16, buffers 1000
        assert_eq!(estimate.memory_bytes, 1600 + 2400 + 1000);
        assert_eq!(estimate.disk_bytes, 1500);
    }

    #[test]
    fn test_quota_check() {
        let quota = ResourceQuota {
            max_memory_bytes: Some(1000),
            max_disk_bytes: None,
        };
        let estimator = MergeResourceEstimator::new(quota).with_buffer_ratio(0.0);
        assert!(estimator.fits(&plan(&[(100, 0, 0)])));
        assert!(matches!(
            estimator.check(&plan(&[(100, 0, 0), (100, 0, 0)])),
            Err(MergeError::ResourceExceeded(_))
        ));
    }

    #[test]
    fn test_base_memory_counts_against_quota() {
        let quota = ResourceQuota {
            max_memory_bytes: Some(1000),
            max_disk_bytes: None,
        };
        let snapshots = [ResourceSnapshot {
            current_memory_use: 150,
            dump_temp_memory_size: 100,
            dump_expand_memory_size: 0,
            dump_file_size: 0,
        }];
        let estimator = MergeResourceEstimator::new(quota)
            .with_buffer_ratio(0.0)
            .with_build_snapshots(&snapshots, 2);
        assert_eq!(estimator.base_memory(), 250);
        // 800 bytes of reclaim map fit alone, not on top of the build.
        assert_eq!(estimator.estimate(&plan(&[(100, 0, 0)])).memory_bytes, 800);
        assert!(matches!(
            estimator.check(&plan(&[(100, 0, 0)])),
            Err(MergeError::ResourceExceeded(_))
        ));
    }

    #[test]
    fn test_concurrent_plans_add_up() {
        let quota = ResourceQuota {
            max_memory_bytes: Some(1000),
            max_disk_bytes: None,
        };
        let plans = [plan(&[(75, 0, 0)]), plan(&[(75, 0, 0)])];
        let serial = MergeResourceEstimator::new(quota).with_buffer_ratio(0.0);
        assert!(serial.check_plans(&plans).is_ok());

        let parallel = serial.clone().with_concurrency(2);
        assert!(parallel.fits(&plans[0]));
        assert!(parallel.fits(&plans[1]));
        let estimates: Vec<_> = plans.iter().map(|p| parallel.estimate(p)).collect();
        assert_eq!(parallel.peak_memory(&estimates), 1200);
        assert!(matches!(
            parallel.check_plans(&plans),
            Err(MergeError::ResourceExceeded(_))
        ));
    }

    #[test]
    fn test_diff_version_lock_size() {
        let catalog = SegmentCatalog {
            version_id: 0,
            level_count: 1,
            segments: vec![CatalogSegment {
                segment_id: 0,
                doc_count: 10,
                is_realtime: false,
                size_bytes: 500,
                deleted_docs: vec![],
                level: 0,
            }],
        };
        let current = SegmentDirectory::from_catalog(&catalog).unwrap();
        let mut next_catalog = catalog.clone();
        next_catalog.segments.push(CatalogSegment {
            segment_id: 1,
            doc_count: 5,
            is_realtime: false,
            size_bytes: 300,
            deleted_docs: vec![],
            level: 0,
        });
        let next = SegmentDirectory::from_catalog(&next_catalog).unwrap();
        assert_eq!(calculate_diff_version_lock_size(&current, &next), 300);
        assert_eq!(calculate_diff_version_lock_size(&next, &current), 0);
    }
}
