//! # segmerge
//!
//! Segment merge (compaction) engine for a segment-based search index.
//!
//! An index partition is a set of immutable segments listed by a Version.
//! segmerge decides which segments to merge, remaps document ids across the
//! merge, carries attribute updates and primary key lookups over to the
//! merged segments, and commits the next Version.
//!
//! ## Modules
//!
//! - [`segment`]: segments, deletion maps, levels and Versions
//! - [`merge`]: strategies, plans, task items, checkpoints and the executor
//! - [`reclaim`]: old to new doc id maps, sorted and unsorted
//! - [`attribute`]: in-place and patch-based attribute updates
//! - [`primary_key`]: primary key load plans and lookup backends
//! - [`resource`]: memory and disk estimates used to admit plans
//! - [`storage`]: the storage interface and its reference backends

pub mod attribute;
pub mod cli;
pub mod error;
pub mod merge;
pub mod primary_key;
pub mod reclaim;
pub mod resource;
pub mod segment;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::error::{MergeError, Result};
    pub use crate::merge::{MergeConfig, MergeExecutor, MergePlan, MergeTask, StrategyKind};
    pub use crate::reclaim::ReclaimMap;
    pub use crate::segment::{DocId, SegmentCatalog, SegmentDirectory, SegmentId};
    pub use crate::storage::{FileStorage, MemoryStorage, Storage};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
