//! Selection of the primary key lookup backend.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::primary_key::lookup::{
    BlockVectorLookup, HashTableLookup, PrimaryKeyLookup, SortedVectorLookup,
};
use crate::segment::DocId;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyIndexType {
    #[default]
    HashTable,
    SortedVector,
    BlockVector,
}

impl FromStr for PrimaryKeyIndexType {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash_table" | "hash" => Ok(PrimaryKeyIndexType::HashTable),
            "sorted_vector" | "sort_array" => Ok(PrimaryKeyIndexType::SortedVector),
            "block_vector" | "block_array" => Ok(PrimaryKeyIndexType::BlockVector),
            other => Err(MergeError::configuration(format!(
                "unknown primary key index type: {other}"
            ))),
        }
    }
}

/// Builds the lookup structure of one load plan with the configured backend.
#[derive(Debug, Clone)]
pub struct PrimaryKeySegmentFormatter {
    index_type: PrimaryKeyIndexType,
    block_size: usize,
    storage: Option<Arc<dyn Storage>>,
}

impl PrimaryKeySegmentFormatter {
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;

    pub fn new(index_type: PrimaryKeyIndexType) -> Self {
        PrimaryKeySegmentFormatter {
            index_type,
            block_size: Self::DEFAULT_BLOCK_SIZE,
            storage: None,
        }
    }

    /// Storage for block vector data.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn index_type(&self) -> PrimaryKeyIndexType {
        self.index_type
    }

    /// Format `(hash, doc)` entries given in doc order. A key seen twice keeps
    /// its later doc. `name` identifies block data in storage.
    pub fn format(&self, entries: &[(u64, DocId)], name: &str) -> Result<Box<dyn PrimaryKeyLookup>> {
        let mut latest: HashMap<u64, DocId, ahash::RandomState> =
            HashMap::with_capacity_and_hasher(entries.len(), ahash::RandomState::new());
        latest.extend(entries.iter().copied());

        let lookup: Box<dyn PrimaryKeyLookup> = match self.index_type {
            PrimaryKeyIndexType::HashTable => {
                let unique: Vec<_> = latest.into_iter().collect();
                Box::new(HashTableLookup::new(&unique))
            }
            PrimaryKeyIndexType::SortedVector => {
                Box::new(SortedVectorLookup::new(sorted(latest))?)
            }
            PrimaryKeyIndexType::BlockVector => {
                let storage = self.storage.clone().ok_or_else(|| {
                    MergeError::configuration("block vector primary keys need a storage")
                })?;
                Box::new(BlockVectorLookup::build(
                    storage,
                    name,
                    &sorted(latest),
                    self.block_size,
                )?)
            }
        };
        log::debug!(
            "formatted {} primary keys as {:?} ({} bytes resident)",
            lookup.len(),
            self.index_type,
            lookup.memory_use()
        );
        Ok(lookup)
    }
}

fn sorted(entries: HashMap<u64, DocId, ahash::RandomState>) -> Vec<(u64, DocId)> {
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_unstable_by_key(|(hash, _)| *hash);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_later_doc_wins_for_every_backend() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let entries = [(7, 0), (3, 1), (7, 2)];
        for index_type in [
            PrimaryKeyIndexType::HashTable,
            PrimaryKeyIndexType::SortedVector,
            PrimaryKeyIndexType::BlockVector,
        ] {
            let lookup = PrimaryKeySegmentFormatter::new(index_type)
                .with_storage(storage.clone())
                .with_block_size(1)
                .format(&entries, "pk_plan_0")
                .unwrap();
            assert_eq!(lookup.len(), 2);
            assert_eq!(lookup.find(7).unwrap(), Some(2));
            assert_eq!(lookup.find(3).unwrap(), Some(1));
        }
    }

    #[test]
    fn test_block_vector_needs_storage() {
        let formatter = PrimaryKeySegmentFormatter::new(PrimaryKeyIndexType::BlockVector);
        assert!(matches!(
            formatter.format(&[(1, 0)], "pk"),
            Err(MergeError::Configuration(_))
        ));
    }

    #[test]
    fn test_index_type_from_str() {
        assert_eq!(
            "sort_array".parse::<PrimaryKeyIndexType>().unwrap(),
            PrimaryKeyIndexType::SortedVector
        );
        assert!("btree".parse::<PrimaryKeyIndexType>().is_err());
    }
}
