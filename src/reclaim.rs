//! Doc id reclamation for merges.
//!
//! A merge drops deleted documents and renumbers the rest. The resulting
//! [`ReclaimMap`] is computed once per merge plan, before any item of the plan
//! runs, and every item translates doc ids through it.
//!
//! Two creators exist:
//!
//! - [`UnsortedReclaimMapCreator`]: segment order, then local order.
//! - [`SortedReclaimMapCreator`]: a k-way merge over per-segment
//!   [`WeightedDocIterator`]s ordered by a [`SortDescriptions`] key. Nulls
//!   sort last; equal keys go to the higher segment id first.
//!
//! # Example
//!
//! ```
//! use segmerge::reclaim::{ReclaimMapCreator, UnsortedReclaimMapCreator};
//! use segmerge::segment::{DeletionMap, SegmentMergeInfo};
//!
//! # fn main() -> segmerge::error::Result<()> {
//! let segments = vec![SegmentMergeInfo::new(0, 0, 5, 0), SegmentMergeInfo::new(1, 5, 5, 1)];
//! let mut deletions = DeletionMap::new();
//! deletions.add_segment(0, 0, 5);
//! deletions.add_segment(1, 5, 5);
//! deletions.delete(6)?;
//!
//! let map = UnsortedReclaimMapCreator.create(&segments, &deletions, None)?;
//! assert_eq!(map.get_new_id(7), Some(6));
//! assert_eq!(map.get_new_id(6), None);
//! # Ok(())
//! # }
//! ```

pub mod creator;
pub mod doc_iterator;
pub mod map;
pub mod sort;
pub mod split;

pub use creator::{
    InMemoryJoinSource, JoinSource, ReclaimMapCreator, SortedReclaimMapCreator,
    UnsortedReclaimMapCreator, create_sub_doc_reclaim_map, sub_segments_of,
};
pub use doc_iterator::{IndexHeap, WeightedDocIterator};
pub use map::{ReclaimMap, ReclaimMapBuilder, ReclaimSegment};
pub use sort::{
    AttributeSource, InMemoryAttributeSource, SortDescription, SortDescriptions, SortKey,
    SortOrder,
};
pub use split::{
    BalancedSplitHandler, DocCountSplitHandler, SegmentSplitHandler, SingleTargetHandler,
};
