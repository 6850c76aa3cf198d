//! Per-segment deletion bitmaps.
//!
//! Deletions are logical: a set bit marks a document that merges must drop.
//! The [`DeletionMapReader`] trait is what merge code consumes; it speaks in
//! global doc ids so reclaim map creation never has to know about segment
//! boundaries.

use std::collections::BTreeMap;

use bit_vec::BitVec;

use crate::error::{MergeError, Result};
use crate::segment::{DocId, SegmentId};
use crate::storage::{Storage, StructReader, StructWriter};

const DELETION_MAP_MAGIC: u32 = 0x4445_4C4D; // "DELM"
const DELETION_MAP_VERSION: u32 = 1;

/// Read access to deletions, addressed by global doc id.
pub trait DeletionMapReader: Send + Sync {
    /// Whether the document is deleted. Unknown ids are not deleted.
    fn is_deleted(&self, doc_id: DocId) -> bool;

    /// Number of deleted documents in a segment.
    fn deleted_doc_count(&self, segment_id: SegmentId) -> u32;
}

/// A reader for partitions without deletions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeletions;

impl DeletionMapReader for NoDeletions {
    fn is_deleted(&self, _doc_id: DocId) -> bool {
        false
    }

    fn deleted_doc_count(&self, _segment_id: SegmentId) -> u32 {
        0
    }
}

/// A bitmap-based deletion tracker for a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDeletionBitmap {
    /// Segment this bitmap belongs to.
    pub segment_id: SegmentId,

    /// Bitmap of deleted local doc ids (bit set = deleted).
    deleted_docs: BitVec,

    /// Number of deleted documents.
    deleted_count: u32,
}

impl SegmentDeletionBitmap {
    /// Create an empty bitmap for a segment with `doc_count` documents.
    pub fn new(segment_id: SegmentId, doc_count: u32) -> Self {
        SegmentDeletionBitmap {
            segment_id,
            deleted_docs: BitVec::from_elem(doc_count as usize, false),
            deleted_count: 0,
        }
    }

    /// Number of documents covered.
    pub fn doc_count(&self) -> u32 {
        self.deleted_docs.len() as u32
    }

    /// Mark a local document as deleted; returns false if it already was.
    pub fn delete(&mut self, local_doc_id: u32) -> Result<bool> {
        if local_doc_id >= self.doc_count() {
            return Err(MergeError::logic(format!(
                "doc {local_doc_id} out of range for segment {} ({} docs)",
                self.segment_id,
                self.doc_count()
            )));
        }

        let was_deleted = self.deleted_docs[local_doc_id as usize];
        if !was_deleted {
            self.deleted_docs.set(local_doc_id as usize, true);
            self.deleted_count += 1;
        }
        Ok(!was_deleted)
    }

    /// Check if a local document is deleted.
    pub fn is_deleted(&self, local_doc_id: u32) -> bool {
        self.deleted_docs
            .get(local_doc_id as usize)
            .unwrap_or(false)
    }

    /// Number of deleted documents.
    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    /// Deleted local doc ids in ascending order.
    pub fn deleted_docs(&self) -> Vec<u32> {
        self.deleted_docs
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Storage name of a segment's deletion map.
    pub fn file_name(segment_id: SegmentId) -> String {
        format!("segment_{segment_id}/deletionmap")
    }

    /// Storage name of the deletion map of a segment's sub documents.
    pub fn sub_file_name(segment_id: SegmentId) -> String {
        format!("segment_{segment_id}/sub_segment/deletionmap")
    }

    /// Persist the bitmap.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        self.store_as(storage, &Self::file_name(self.segment_id))
    }

    /// Persist the bitmap as the sub-document deletion map of its segment.
    pub fn store_sub(&self, storage: &dyn Storage) -> Result<()> {
        self.store_as(storage, &Self::sub_file_name(self.segment_id))
    }

    fn store_as(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(DELETION_MAP_MAGIC, DELETION_MAP_VERSION)?;
        writer.write_u32(self.segment_id)?;
        writer.write_u32(self.doc_count())?;
        writer.write_delta_u32s(&self.deleted_docs())?;
        writer.close()
    }

    /// Load a persisted bitmap.
    pub fn load(storage: &dyn Storage, segment_id: SegmentId) -> Result<Self> {
        Self::load_from(storage, segment_id, &Self::file_name(segment_id))
    }

    pub fn load_sub(storage: &dyn Storage, segment_id: SegmentId) -> Result<Self> {
        Self::load_from(storage, segment_id, &Self::sub_file_name(segment_id))
    }

    fn load_from(storage: &dyn Storage, segment_id: SegmentId, name: &str) -> Result<Self> {
        let input = storage.open_input(name)?;
        let mut reader = StructReader::open(input)?;
        reader.expect_header(DELETION_MAP_MAGIC, DELETION_MAP_VERSION)?;

        let stored_id = reader.read_u32()?;
        if stored_id != segment_id {
            return Err(MergeError::corrupt(format!(
                "deletion map of segment {segment_id} claims segment {stored_id}"
            )));
        }
        let doc_count = reader.read_u32()?;
        let mut bitmap = SegmentDeletionBitmap::new(segment_id, doc_count);
        for local in reader.read_delta_u32s()? {
            bitmap
                .delete(local)
                .map_err(|e| MergeError::corrupt(e.to_string()))?;
        }
        Ok(bitmap)
    }
}

/// Deletions of every segment in a Version.
#[derive(Debug, Clone, Default)]
pub struct DeletionMap {
    bitmaps: BTreeMap<SegmentId, SegmentDeletionBitmap>,

    /// base doc id -> segment id, for global lookups.
    by_base: BTreeMap<DocId, SegmentId>,

    /// segment id -> base doc id.
    bases: BTreeMap<SegmentId, DocId>,
}

impl DeletionMap {
    /// Create an empty deletion map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment and its doc id range.
    pub fn add_segment(&mut self, segment_id: SegmentId, base_doc_id: DocId, doc_count: u32) {
        self.bitmaps
            .entry(segment_id)
            .or_insert_with(|| SegmentDeletionBitmap::new(segment_id, doc_count));
        self.rebase(segment_id, base_doc_id);
    }

    /// Register a segment with an existing bitmap.
    pub fn insert_bitmap(&mut self, base_doc_id: DocId, bitmap: SegmentDeletionBitmap) {
        let segment_id = bitmap.segment_id;
        self.bitmaps.insert(segment_id, bitmap);
        self.rebase(segment_id, base_doc_id);
    }

    /// Move a segment to a new base doc id.
    pub fn rebase(&mut self, segment_id: SegmentId, base_doc_id: DocId) {
        if let Some(old_base) = self.bases.insert(segment_id, base_doc_id)
            && self.by_base.get(&old_base) == Some(&segment_id)
        {
            self.by_base.remove(&old_base);
        }
        self.by_base.insert(base_doc_id, segment_id);
    }

    /// Forget a segment.
    pub fn remove_segment(&mut self, segment_id: SegmentId) -> Option<SegmentDeletionBitmap> {
        if let Some(base) = self.bases.remove(&segment_id)
            && self.by_base.get(&base) == Some(&segment_id)
        {
            self.by_base.remove(&base);
        }
        self.bitmaps.remove(&segment_id)
    }

    /// Delete a document in a segment by local id.
    pub fn delete_local(&mut self, segment_id: SegmentId, local_doc_id: u32) -> Result<bool> {
        self.bitmaps
            .get_mut(&segment_id)
            .ok_or_else(|| MergeError::logic(format!("unknown segment {segment_id}")))?
            .delete(local_doc_id)
    }

    /// Delete a document by global id.
    pub fn delete(&mut self, doc_id: DocId) -> Result<bool> {
        let (segment_id, local) = self
            .locate(doc_id)
            .ok_or_else(|| MergeError::logic(format!("doc {doc_id} is outside every segment")))?;
        self.delete_local(segment_id, local)
    }

    /// Bitmap of one segment.
    pub fn bitmap(&self, segment_id: SegmentId) -> Option<&SegmentDeletionBitmap> {
        self.bitmaps.get(&segment_id)
    }

    /// Translate a global doc id to (segment, local doc id).
    pub fn locate(&self, doc_id: DocId) -> Option<(SegmentId, u32)> {
        let (&base, &segment_id) = self.by_base.range(..=doc_id).next_back()?;
        let local = doc_id - base;
        let bitmap = self.bitmaps.get(&segment_id)?;
        (local < bitmap.doc_count()).then_some((segment_id, local))
    }
}

impl DeletionMapReader for DeletionMap {
    fn is_deleted(&self, doc_id: DocId) -> bool {
        match self.locate(doc_id) {
            Some((segment_id, local)) => self
                .bitmaps
                .get(&segment_id)
                .is_some_and(|bitmap| bitmap.is_deleted(local)),
            None => false,
        }
    }

    fn deleted_doc_count(&self, segment_id: SegmentId) -> u32 {
        self.bitmaps
            .get(&segment_id)
            .map_or(0, |bitmap| bitmap.deleted_count())
    }
}
