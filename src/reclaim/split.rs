//! Assignment of retained documents to target segments.
//!
//! A reclaim map creator asks the handler for a target index once per
//! retained document, in new-id order. Handlers must hand out non-decreasing
//! indexes so each target keeps a contiguous new-id range.

use crate::error::{MergeError, Result};
use crate::segment::SegmentId;

/// Chooses the target segment of each retained document.
pub trait SegmentSplitHandler: Send {
    /// Number of target segments.
    fn target_segment_count(&self) -> usize;

    /// Target index for the next retained document.
    fn target_segment_index(&mut self, segment_id: SegmentId, local_doc_id: u32) -> usize;
}

/// Everything goes to one target.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTargetHandler;

impl SegmentSplitHandler for SingleTargetHandler {
    fn target_segment_count(&self) -> usize {
        1
    }

    fn target_segment_index(&mut self, _segment_id: SegmentId, _local_doc_id: u32) -> usize {
        0
    }
}

/// Spreads `total_doc_count` documents evenly over `target_count` targets.
#[derive(Debug, Clone)]
pub struct BalancedSplitHandler {
    target_count: usize,
    total_doc_count: u64,
    assigned: u64,
}

impl BalancedSplitHandler {
    pub fn new(target_count: usize, total_doc_count: u64) -> Result<Self> {
        if target_count == 0 {
            return Err(MergeError::configuration("target segment count must be positive"));
        }
        Ok(BalancedSplitHandler {
            target_count,
            total_doc_count,
            assigned: 0,
        })
    }
}

impl SegmentSplitHandler for BalancedSplitHandler {
    fn target_segment_count(&self) -> usize {
        self.target_count
    }

    fn target_segment_index(&mut self, _segment_id: SegmentId, _local_doc_id: u32) -> usize {
        let idx = if self.total_doc_count == 0 {
            0
        } else {
            (self.assigned * self.target_count as u64 / self.total_doc_count) as usize
        };
        self.assigned += 1;
        idx.min(self.target_count - 1)
    }
}

/// Fills each target up to `max_doc_count` before moving to the next one.
/// The last target takes whatever remains.
#[derive(Debug, Clone)]
pub struct DocCountSplitHandler {
    max_doc_count: u64,
    target_count: usize,
    assigned: u64,
}

impl DocCountSplitHandler {
    pub fn new(max_doc_count: u64, target_count: usize) -> Result<Self> {
        if max_doc_count == 0 || target_count == 0 {
            return Err(MergeError::configuration(
                "split handler needs a positive doc count and target count",
            ));
        }
        Ok(DocCountSplitHandler {
            max_doc_count,
            target_count,
            assigned: 0,
        })
    }
}

impl SegmentSplitHandler for DocCountSplitHandler {
    fn target_segment_count(&self) -> usize {
        self.target_count
    }

    fn target_segment_index(&mut self, _segment_id: SegmentId, _local_doc_id: u32) -> usize {
        let idx = (self.assigned / self.max_doc_count) as usize;
        self.assigned += 1;
        idx.min(self.target_count - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign_all(handler: &mut dyn SegmentSplitHandler, count: u32) -> Vec<usize> {
        (0..count)
            .map(|doc| handler.target_segment_index(0, doc))
            .collect()
    }

    #[test]
    fn test_balanced_split_is_contiguous_and_even() {
        let mut handler = BalancedSplitHandler::new(3, 7).unwrap();
        let targets = assign_all(&mut handler, 7);
        assert_eq!(targets, vec![0, 0, 0, 1, 1, 2, 2]);
        assert!(targets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_balanced_split_overflow_goes_to_last() {
        let mut handler = BalancedSplitHandler::new(2, 2).unwrap();
        assert_eq!(assign_all(&mut handler, 4), vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_doc_count_split() {
        let mut handler = DocCountSplitHandler::new(2, 2).unwrap();
        assert_eq!(assign_all(&mut handler, 5), vec![0, 0, 1, 1, 1]);
        assert!(DocCountSplitHandler::new(0, 2).is_err());
    }

    #[test]
    fn test_single_target() {
        let mut handler = SingleTargetHandler;
        assert_eq!(handler.target_segment_count(), 1);
        assert_eq!(assign_all(&mut handler, 3), vec![0, 0, 0]);
    }
}
