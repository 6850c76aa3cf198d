//! Primary key segment data and loading of partition-wide lookups.

use std::sync::Arc;

use crate::error::{MergeError, Result};
use crate::primary_key::formatter::PrimaryKeySegmentFormatter;
use crate::primary_key::load_strategy::{PrimaryKeyLoadPlan, PrimaryKeyLoadStrategy};
use crate::primary_key::lookup::{PrimaryKeyLookup, hash_primary_key};
use crate::segment::{DeletionMapReader, DocId, SegmentDirectory, SegmentId};
use crate::storage::{Storage, StructReader, StructWriter};

const PK_SEGMENT_MAGIC: u32 = 0x504B_4559; // "PKEY"
const PK_SEGMENT_VERSION: u32 = 1;

/// Primary key data of one segment: `(key hash, local doc id)` pairs in
/// local doc order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeySegmentData {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    pub entries: Vec<(u64, u32)>,
}

impl PrimaryKeySegmentData {
    pub fn file_name(segment_id: SegmentId) -> String {
        format!("segment_{segment_id}/primary_key")
    }

    /// One key per document, in local doc order.
    pub fn from_keys<S: AsRef<str>>(segment_id: SegmentId, keys: &[S]) -> Self {
        PrimaryKeySegmentData {
            segment_id,
            doc_count: keys.len() as u32,
            entries: keys
                .iter()
                .enumerate()
                .map(|(local, key)| (hash_primary_key(key.as_ref()), local as u32))
                .collect(),
        }
    }

    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        let name = Self::file_name(self.segment_id);
        let mut writer = StructWriter::new(storage.create_output(&name)?);
        writer.write_header(PK_SEGMENT_MAGIC, PK_SEGMENT_VERSION)?;
        writer.write_u32(self.segment_id)?;
        writer.write_u32(self.doc_count)?;
        writer.write_varint(self.entries.len() as u64)?;
        for &(hash, local) in &self.entries {
            writer.write_u64(hash)?;
            writer.write_varint(local as u64)?;
        }
        writer.close()
    }

    /// Malformed data is [`MergeError::CorruptData`].
    pub fn load(storage: &dyn Storage, segment_id: SegmentId) -> Result<Self> {
        let name = Self::file_name(segment_id);
        let mut reader = StructReader::open(storage.open_input(&name)?)?;
        reader.expect_header(PK_SEGMENT_MAGIC, PK_SEGMENT_VERSION)?;
        let stored_id = reader.read_u32()?;
        if stored_id != segment_id {
            return Err(MergeError::corrupt(format!(
                "{name}: holds segment {stored_id}"
            )));
        }
        let doc_count = reader.read_u32()?;
        let count = reader.read_varint()? as usize;
        let mut entries = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let hash = reader.read_u64()?;
            let local = reader.read_varint()?;
            if local >= doc_count as u64 {
                return Err(MergeError::corrupt(format!(
                    "{name}: doc {local} beyond {doc_count} docs"
                )));
            }
            entries.push((hash, local as u32));
        }
        if !reader.is_eof() {
            return Err(MergeError::corrupt(format!("{name}: trailing bytes")));
        }
        Ok(PrimaryKeySegmentData {
            segment_id,
            doc_count,
            entries,
        })
    }
}

/// Primary key lookups of a whole partition, one per load plan.
#[derive(Debug)]
pub struct PrimaryKeyReader {
    plans: Vec<(PrimaryKeyLoadPlan, Box<dyn PrimaryKeyLookup>)>,
}

impl PrimaryKeyReader {
    pub fn plans(&self) -> impl Iterator<Item = &PrimaryKeyLoadPlan> {
        self.plans.iter().map(|(plan, _)| plan)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    /// Global doc id of a key. Newer plans shadow older ones.
    pub fn find(&self, key_hash: u64) -> Result<Option<DocId>> {
        for (_, lookup) in self.plans.iter().rev() {
            if let Some(doc_id) = lookup.find(key_hash)? {
                return Ok(Some(doc_id));
            }
        }
        Ok(None)
    }

    pub fn find_key(&self, key: &str) -> Result<Option<DocId>> {
        self.find(hash_primary_key(key))
    }

    pub async fn find_async(&self, key_hash: u64) -> Result<Option<DocId>> {
        for (_, lookup) in self.plans.iter().rev() {
            if let Some(doc_id) = lookup.find_async(key_hash).await? {
                return Ok(Some(doc_id));
            }
        }
        Ok(None)
    }

    pub fn memory_use(&self) -> u64 {
        self.plans.iter().map(|(_, l)| l.memory_use()).sum()
    }
}

/// Loads the primary key data of a partition into lookups.
pub struct PrimaryKeyLoader {
    strategy: Box<dyn PrimaryKeyLoadStrategy>,
    formatter: PrimaryKeySegmentFormatter,
}

impl PrimaryKeyLoader {
    pub fn new(strategy: Box<dyn PrimaryKeyLoadStrategy>, formatter: PrimaryKeySegmentFormatter) -> Self {
        PrimaryKeyLoader {
            strategy,
            formatter,
        }
    }

    pub fn load(&self, storage: &Arc<dyn Storage>, directory: &SegmentDirectory) -> Result<PrimaryKeyReader> {
        let deletions = directory.deletion_map();
        let plans = self
            .strategy
            .create_load_plans(directory.segments(), deletions)?;

        let mut loaded = Vec::with_capacity(plans.len());
        for (idx, plan) in plans.into_iter().enumerate() {
            let entries = self.plan_entries(storage.as_ref(), directory, deletions, &plan)?;
            let lookup = self
                .formatter
                .format(&entries, &format!("primary_key/plan_{idx}"))?;
            loaded.push((plan, lookup));
        }
        log::info!(
            "loaded primary keys of {} segments into {} lookups",
            directory.segments().len(),
            loaded.len()
        );
        Ok(PrimaryKeyReader { plans: loaded })
    }

    fn plan_entries(
        &self,
        storage: &dyn Storage,
        directory: &SegmentDirectory,
        deletions: &dyn DeletionMapReader,
        plan: &PrimaryKeyLoadPlan,
    ) -> Result<Vec<(u64, DocId)>> {
        let mut entries = Vec::with_capacity(plan.live_doc_count() as usize);
        for &segment_id in &plan.segment_ids {
            let segment = directory
                .segment(segment_id)
                .ok_or_else(|| MergeError::not_found(format!("segment {segment_id}")))?;
            let data = PrimaryKeySegmentData::load(storage, segment_id)?;
            if data.doc_count != segment.doc_count {
                return Err(MergeError::corrupt(format!(
                    "primary key of segment {segment_id} covers {} docs, segment has {}",
                    data.doc_count, segment.doc_count
                )));
            }
            entries.extend(
                data.entries
                    .into_iter()
                    .map(|(hash, local)| (hash, segment.base_doc_id + local))
                    .filter(|&(_, doc_id)| !deletions.is_deleted(doc_id)),
            );
        }
        Ok(entries)
    }
}
