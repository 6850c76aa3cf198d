//! Segment metadata records.

use serde::{Deserialize, Serialize};

use crate::segment::{DocId, SegmentId};

/// Current binary format version written by this crate.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Metadata of one immutable segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment identifier.
    pub segment_id: SegmentId,

    /// Number of documents stored in the segment, deleted ones included.
    pub doc_count: u32,

    /// First global doc id of the segment within its Version.
    pub base_doc_id: DocId,

    /// Binary format version of the segment data.
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// Size of the segment on disk.
    #[serde(default)]
    pub size_bytes: u64,

    /// Whether the segment was produced by realtime (in-memory) building.
    #[serde(default)]
    pub is_realtime: bool,

    /// Whether the segment is the output of a merge.
    #[serde(default)]
    pub merged: bool,
}

fn default_format_version() -> u32 {
    SEGMENT_FORMAT_VERSION
}

impl SegmentInfo {
    /// Create a freshly built (unmerged) segment record.
    pub fn new(segment_id: SegmentId, doc_count: u32) -> Self {
        SegmentInfo {
            segment_id,
            doc_count,
            base_doc_id: 0,
            format_version: SEGMENT_FORMAT_VERSION,
            size_bytes: 0,
            is_realtime: false,
            merged: false,
        }
    }

    /// Exclusive end of the segment's global doc id range.
    pub fn end_doc_id(&self) -> DocId {
        self.base_doc_id + self.doc_count
    }
}

/// Read-only merge input view of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMergeInfo {
    /// Segment identifier.
    pub segment_id: SegmentId,

    /// First global doc id of the segment.
    pub base_doc_id: DocId,

    /// Documents in the segment, deleted ones included.
    pub doc_count: u32,

    /// Deleted documents in the segment.
    pub deleted_doc_count: u32,

    /// Size of the segment on disk.
    #[serde(default)]
    pub segment_size: u64,
}

impl SegmentMergeInfo {
    /// Create a merge info.
    pub fn new(
        segment_id: SegmentId,
        base_doc_id: DocId,
        doc_count: u32,
        deleted_doc_count: u32,
    ) -> Self {
        SegmentMergeInfo {
            segment_id,
            base_doc_id,
            doc_count,
            deleted_doc_count,
            segment_size: 0,
        }
    }

    /// Documents that survive a merge.
    pub fn live_doc_count(&self) -> u32 {
        self.doc_count.saturating_sub(self.deleted_doc_count)
    }

    /// Deleted docs / total docs, 0.0 for empty segments.
    pub fn deletion_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.deleted_doc_count as f64 / self.doc_count as f64
        }
    }

    /// Whether `doc_id` (global) falls inside this segment.
    pub fn contains(&self, doc_id: DocId) -> bool {
        doc_id >= self.base_doc_id && doc_id - self.base_doc_id < self.doc_count
    }
}
