//! Segment merging.
//!
//! A merge runs in three steps:
//!
//! 1. A [`MergeStrategy`] turns the segments of a Version into a
//!    [`MergeTask`]: ordered [`MergePlan`]s, each naming its inputs, the
//!    number of output segments and the level they land on.
//! 2. The task is expanded into [`MergeTaskItem`]s, one per merge type,
//!    target segment and parallel shard, and persisted with its items so an
//!    interrupted merge can resume.
//! 3. The [`MergeExecutor`] runs the items, checkpointing each one, and
//!    commits the next Version once every plan has finished.
//!
//! ```
//! use std::sync::Arc;
//!
//! use segmerge::merge::{MergeConfig, MergeExecutor, StrategyKind};
//! use segmerge::segment::{SegmentCatalog, SegmentDirectory};
//! use segmerge::storage::MemoryStorage;
//!
//! # fn main() -> segmerge::error::Result<()> {
//! let catalog = SegmentCatalog::from_json(
//!     r#"{"segments": [
//!         {"segment_id": 0, "doc_count": 10, "deleted_docs": [3]},
//!         {"segment_id": 1, "doc_count": 5}
//!     ]}"#,
//! )?;
//! let directory = SegmentDirectory::from_catalog(&catalog)?;
//! let config = MergeConfig {
//!     strategy: StrategyKind::Optimize,
//!     merge_threads: 1,
//!     ..MergeConfig::default()
//! };
//! let executor = MergeExecutor::new(Arc::new(MemoryStorage::new()), config)?;
//! let outcome = executor.merge(&directory)?;
//! assert_eq!(outcome.directory.total_doc_count(), 14);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod executor;
pub mod item_creator;
pub mod plan;
pub mod strategy;
pub mod task_item;

pub use checkpoint::{CHECKPOINT_DIR, CheckpointStore};
pub use config::{MergeConfig, MergeStrategyParameter, StrategyKind};
pub use executor::{
    MergeContext, MergeExecutor, MergeOutcome, MergeStats, MergeWorkItem, MergeWorkItemFactory,
};
pub use item_creator::{MergeMeta, MergeSchema, MergeTaskItemCreator};
pub use plan::{MergePlan, MergeTask};
pub use strategy::{
    BalanceTreeMergeStrategy, MergeStrategy, OptimizeMergeStrategy, SpecificSegmentsMergeStrategy,
    create_strategy,
};
pub use task_item::{CheckpointName, MergeTaskItem, MergeType, ParallelMergeItem, checkpoint_name};
