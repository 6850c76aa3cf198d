//! Segment catalog consumed by the merge engine.
//!
//! A [`SegmentDirectory`] is the read-only view of one committed
//! [`Version`]: which segments are live, where their doc ids start, how many
//! of their documents are deleted and which level each belongs to. Merges
//! never edit it; committing a merge produces a new directory.

pub mod deletion;
pub mod directory;
pub mod info;
pub mod reader_cache;

pub use deletion::{DeletionMap, DeletionMapReader, NoDeletions, SegmentDeletionBitmap};
pub use directory::{
    CatalogSegment, LevelInfo, LevelMeta, LevelTopology, MergedSegment, SegmentCatalog,
    SegmentDirectory, Version,
};
pub use info::{SegmentInfo, SegmentMergeInfo};
pub use reader_cache::{CleanupTask, SegmentReaderCache};

/// Global (partition-wide) document identifier.
pub type DocId = u32;

/// Segment identifier. Merged segments always get ids above their inputs.
pub type SegmentId = u32;
