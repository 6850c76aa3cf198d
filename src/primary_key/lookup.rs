//! Primary key lookup backends.
//!
//! Keys are 64-bit hashes of the primary key string. All backends answer
//! the same question through [`PrimaryKeyLookup`]:
//!
//! | Backend | Lookup | Memory |
//! |---|---|---|
//! | [`HashTableLookup`] | O(1) expected | highest |
//! | [`SortedVectorLookup`] | O(log n) | 12 bytes per key |
//! | [`BlockVectorLookup`] | O(log n) + one block read | block index only |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{MergeError, Result};
use crate::segment::DocId;
use crate::storage::{Storage, StructReader, StructWriter};

const PK_BLOCK_MAGIC: u32 = 0x504B_424C; // "PKBL"
const PK_BLOCK_VERSION: u32 = 1;

/// Fixed seeds so key hashes are stable across processes.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x27d4_eb2f_1656_67c5,
);

/// Hash of a primary key string.
pub fn hash_primary_key(key: &str) -> u64 {
    ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3)
        .hash_one(key)
}

/// Maps primary key hashes to doc ids.
pub trait PrimaryKeyLookup: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the key is absent. Errors only come from reading
    /// cold data.
    fn find(&self, key_hash: u64) -> Result<Option<DocId>>;

    /// Asynchronous [`Self::find`].
    fn find_async(&self, key_hash: u64) -> BoxFuture<'_, Result<Option<DocId>>> {
        Box::pin(futures::future::ready(self.find(key_hash)))
    }

    fn find_key(&self, key: &str) -> Result<Option<DocId>> {
        self.find(hash_primary_key(key))
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident bytes.
    fn memory_use(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct HashTableLookup {
    table: HashMap<u64, DocId, ahash::RandomState>,
}

impl HashTableLookup {
    /// Build from `(hash, doc)` pairs; unique keys expected.
    pub fn new(entries: &[(u64, DocId)]) -> Self {
        let mut table = HashMap::with_capacity_and_hasher(entries.len(), ahash::RandomState::new());
        table.extend(entries.iter().copied());
        HashTableLookup { table }
    }
}

impl PrimaryKeyLookup for HashTableLookup {
    fn find(&self, key_hash: u64) -> Result<Option<DocId>> {
        Ok(self.table.get(&key_hash).copied())
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn memory_use(&self) -> u64 {
        // Slot plus control byte, at the table's load factor.
        (self.table.capacity() * (std::mem::size_of::<(u64, DocId)>() + 1)) as u64
    }
}

#[derive(Debug, Clone)]
pub struct SortedVectorLookup {
    entries: Vec<(u64, DocId)>,
}

impl SortedVectorLookup {
    /// Build from entries sorted by hash with unique keys.
    pub fn new(entries: Vec<(u64, DocId)>) -> Result<Self> {
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(MergeError::logic("sorted vector entries must be strictly ascending"));
        }
        Ok(SortedVectorLookup { entries })
    }
}

impl PrimaryKeyLookup for SortedVectorLookup {
    fn find(&self, key_hash: u64) -> Result<Option<DocId>> {
        Ok(self
            .entries
            .binary_search_by_key(&key_hash, |(hash, _)| *hash)
            .ok()
            .map(|idx| self.entries[idx].1))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn memory_use(&self) -> u64 {
        (self.entries.len() * std::mem::size_of::<(u64, DocId)>()) as u64
    }
}

/// Sorted entries split into fixed-size blocks kept in storage. Only the
/// first key of every block stays in memory; a lookup reads one block.
pub struct BlockVectorLookup {
    storage: Arc<dyn Storage>,
    prefix: String,
    first_keys: Vec<u64>,
    len: usize,
}

impl fmt::Debug for BlockVectorLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockVectorLookup")
            .field("prefix", &self.prefix)
            .field("blocks", &self.first_keys.len())
            .field("len", &self.len)
            .finish()
    }
}

impl BlockVectorLookup {
    fn block_name(prefix: &str, block: usize) -> String {
        format!("{prefix}/block_{block}")
    }

    /// Write sorted, unique entries as blocks under `prefix`.
    pub fn build(
        storage: Arc<dyn Storage>,
        prefix: impl Into<String>,
        entries: &[(u64, DocId)],
        block_size: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(MergeError::configuration("block size must be positive"));
        }
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(MergeError::logic("block vector entries must be strictly ascending"));
        }
        let prefix = prefix.into();
        let mut first_keys = Vec::with_capacity(entries.len().div_ceil(block_size));
        for (block, chunk) in entries.chunks(block_size).enumerate() {
            first_keys.push(chunk[0].0);
            let mut writer = StructWriter::new(storage.create_output(&Self::block_name(&prefix, block))?);
            writer.write_header(PK_BLOCK_MAGIC, PK_BLOCK_VERSION)?;
            writer.write_varint(chunk.len() as u64)?;
            for &(hash, doc_id) in chunk {
                writer.write_u64(hash)?;
                writer.write_u32(doc_id)?;
            }
            writer.close()?;
        }
        Ok(BlockVectorLookup {
            storage,
            prefix,
            first_keys,
            len: entries.len(),
        })
    }

    fn block_for(&self, key_hash: u64) -> Option<usize> {
        match self.first_keys.binary_search(&key_hash) {
            Ok(block) => Some(block),
            Err(0) => None,
            Err(insert) => Some(insert - 1),
        }
    }

    fn read_block(storage: &dyn Storage, name: &str) -> Result<Vec<(u64, DocId)>> {
        let mut reader = StructReader::open(storage.open_input(name)?)?;
        reader.expect_header(PK_BLOCK_MAGIC, PK_BLOCK_VERSION)?;
        let count = reader.read_varint()? as usize;
        let mut entries = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            entries.push((reader.read_u64()?, reader.read_u32()?));
        }
        Ok(entries)
    }

    fn search_block(storage: &dyn Storage, name: &str, key_hash: u64) -> Result<Option<DocId>> {
        let entries = Self::read_block(storage, name)?;
        Ok(entries
            .binary_search_by_key(&key_hash, |(hash, _)| *hash)
            .ok()
            .map(|idx| entries[idx].1))
    }

    pub fn block_count(&self) -> usize {
        self.first_keys.len()
    }
}

impl PrimaryKeyLookup for BlockVectorLookup {
    fn find(&self, key_hash: u64) -> Result<Option<DocId>> {
        let Some(block) = self.block_for(key_hash) else {
            return Ok(None);
        };
        Self::search_block(
            self.storage.as_ref(),
            &Self::block_name(&self.prefix, block),
            key_hash,
        )
    }

    /// Reads the block on tokio's blocking pool.
    fn find_async(&self, key_hash: u64) -> BoxFuture<'_, Result<Option<DocId>>> {
        let Some(block) = self.block_for(key_hash) else {
            return Box::pin(futures::future::ready(Ok(None)));
        };
        let storage = Arc::clone(&self.storage);
        let name = Self::block_name(&self.prefix, block);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                Self::search_block(storage.as_ref(), &name, key_hash)
            })
            .await
            .map_err(|e| MergeError::other(format!("primary key block read failed: {e}")))?
        })
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_use(&self) -> u64 {
        (self.first_keys.len() * std::mem::size_of::<u64>()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn entries() -> Vec<(u64, DocId)> {
        (0..100u64).map(|i| (i * 10 + 5, i as DocId)).collect()
    }

    fn backends() -> Vec<Box<dyn PrimaryKeyLookup>> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        vec![
            Box::new(HashTableLookup::new(&entries())),
            Box::new(SortedVectorLookup::new(entries()).unwrap()),
            Box::new(BlockVectorLookup::build(storage, "pk", &entries(), 16).unwrap()),
        ]
    }

    #[test]
    fn test_backends_agree() {
        for lookup in backends() {
            assert_eq!(lookup.len(), 100);
            assert_eq!(lookup.find(5).unwrap(), Some(0), "{lookup:?}");
            assert_eq!(lookup.find(995).unwrap(), Some(99), "{lookup:?}");
            assert_eq!(lookup.find(475).unwrap(), Some(47), "{lookup:?}");
            assert_eq!(lookup.find(0).unwrap(), None, "{lookup:?}");
            assert_eq!(lookup.find(476).unwrap(), None, "{lookup:?}");
            assert_eq!(lookup.find(u64::MAX).unwrap(), None, "{lookup:?}");
        }
    }

    #[tokio::test]
    async fn test_find_async() {
        for lookup in backends() {
            assert_eq!(lookup.find_async(165).await.unwrap(), Some(16));
            assert_eq!(lookup.find_async(1).await.unwrap(), None);
        }
    }

    #[test]
    fn test_in_memory_find_async_needs_no_runtime() {
        let lookup = SortedVectorLookup::new(entries()).unwrap();
        assert_eq!(tokio_test::block_on(lookup.find_async(475)).unwrap(), Some(47));
        assert_eq!(tokio_test::block_on(lookup.find_async(476)).unwrap(), None);
    }

    #[test]
    fn test_block_vector_corruption_is_error() {
        let storage = Arc::new(MemoryStorage::new());
        let lookup = BlockVectorLookup::build(storage.clone(), "pk", &entries(), 16).unwrap();
        assert_eq!(lookup.block_count(), 7);
        storage.replace_bytes("pk/block_1", vec![0, 1, 2, 3, 4, 5]);
        assert!(matches!(
            lookup.find(165),
            Err(MergeError::CorruptData(_))
        ));
        assert_eq!(lookup.find(5).unwrap(), Some(0));
    }

    #[test]
    fn test_unsorted_entries_rejected() {
        assert!(SortedVectorLookup::new(vec![(2, 0), (1, 1)]).is_err());
        assert!(SortedVectorLookup::new(vec![(1, 0), (1, 1)]).is_err());
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(hash_primary_key("doc-1"), hash_primary_key("doc-1"));
        assert_ne!(hash_primary_key("doc-1"), hash_primary_key("doc-2"));
        let lookup = HashTableLookup::new(&[(hash_primary_key("doc-1"), 4)]);
        assert_eq!(lookup.find_key("doc-1").unwrap(), Some(4));
        assert_eq!(lookup.find_key("doc-9").unwrap(), None);
    }
}
