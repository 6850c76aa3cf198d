//! Resource and size calculators.
//!
//! Builders and modifiers report what they hold through
//! [`ResourceMetricsProvider`]s; merge strategies and the executor use a
//! [`MergeResourceEstimator`] to reject or split plans that would exceed the
//! configured [`ResourceQuota`] before anything is written.

pub mod estimator;
pub mod metrics;

pub use estimator::{
    MergeResourceEstimator, PlanResourceEstimate, ResourceQuota, calculate_diff_version_lock_size,
    estimate_max_memory_use,
};
pub use metrics::{
    BuildResourceMetrics, ResourceMetricsNode, ResourceMetricsProvider, ResourceSnapshot,
};
