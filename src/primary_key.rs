//! Primary key lookup for a partition.
//!
//! Segment primary key data is grouped into load plans by a
//! [`PrimaryKeyLoadStrategy`]; each plan becomes one lookup structure built
//! by the [`PrimaryKeySegmentFormatter`]. Callers only see
//! [`PrimaryKeyLookup`] and never branch on the backend.

pub mod formatter;
pub mod load_strategy;
pub mod loader;
pub mod lookup;

pub use formatter::{PrimaryKeyIndexType, PrimaryKeySegmentFormatter};
pub use load_strategy::{CombineSegmentsLoadStrategy, PrimaryKeyLoadPlan, PrimaryKeyLoadStrategy};
pub use loader::{PrimaryKeyLoader, PrimaryKeyReader, PrimaryKeySegmentData};
pub use lookup::{
    BlockVectorLookup, HashTableLookup, PrimaryKeyLookup, SortedVectorLookup, hash_primary_key,
};
