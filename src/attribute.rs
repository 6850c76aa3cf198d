//! Attribute storage, post-build updates and patch consolidation.
//!
//! Attributes are per-document field values used for sorting, filtering and
//! display. After a segment is built its attributes can still change:
//!
//! - open segments are updated in place ([`InPlaceAttributeModifier`]);
//! - built segments get patch files ([`PatchAttributeModifier`]), one new
//!   generation per incremental build;
//! - a merge folds all generations into a single patch per output segment
//!   ([`PatchDedupMerger`]), newest value first.

pub mod column;
pub mod modifier;
pub mod pack;
pub mod patch;
pub mod patch_merger;
pub mod value;

pub use column::{AttributeColumn, AttributeSegment, AttributeSegmentSet};
pub use modifier::{AttributeModifier, InPlaceAttributeModifier, PatchAttributeModifier};
pub use pack::PackAttribute;
pub use patch::{PatchKind, PatchRecord, PatchTarget};
pub use patch_merger::PatchDedupMerger;
pub use value::{AttributeType, AttributeValue};
