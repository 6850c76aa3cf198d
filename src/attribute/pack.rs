//! Pack attributes: several fields encoded together in one blob per document.

use std::sync::Arc;

use bincode::Options;
use bit_vec::BitVec;
use parking_lot::{Mutex, RwLock};

use crate::attribute::value::{AttributeValue, blob_codec};
use crate::error::{MergeError, Result};

type PackBlob = Vec<Option<AttributeValue>>;

/// A pack attribute of one segment.
///
/// Updating any member rewrites the whole blob of that document. Updated
/// documents are flagged in a dirty bitmap so a merge knows which packs to
/// re-encode.
#[derive(Debug)]
pub struct PackAttribute {
    name: String,
    fields: Vec<String>,
    blobs: Box<[RwLock<Arc<[u8]>>]>,
    dirty: Mutex<BitVec>,
}

fn encode(blob: &PackBlob) -> Result<Arc<[u8]>> {
    blob_codec()
        .serialize(blob)
        .map(Into::into)
        .map_err(|e| MergeError::internal(format!("encode pack: {e}")))
}

fn decode(bytes: &[u8]) -> Result<PackBlob> {
    blob_codec()
        .deserialize(bytes)
        .map_err(|e| MergeError::corrupt(format!("decode pack: {e}")))
}

impl PackAttribute {
    pub fn new(name: impl Into<String>, fields: Vec<String>, doc_count: u32) -> Result<Self> {
        if fields.len() > u16::MAX as usize {
            return Err(MergeError::configuration("too many fields in one pack"));
        }
        let empty = encode(&vec![None; fields.len()])?;
        Ok(PackAttribute {
            name: name.into(),
            blobs: (0..doc_count).map(|_| RwLock::new(empty.clone())).collect(),
            dirty: Mutex::new(BitVec::from_elem(doc_count as usize, false)),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn doc_count(&self) -> u32 {
        self.blobs.len() as u32
    }

    pub fn field_index(&self, field: &str) -> Option<u16> {
        self.fields.iter().position(|f| f == field).map(|i| i as u16)
    }

    fn blob(&self, doc_id: u32) -> Result<&RwLock<Arc<[u8]>>> {
        self.blobs.get(doc_id as usize).ok_or_else(|| {
            MergeError::logic(format!(
                "doc {doc_id} outside pack '{}' range [0, {})",
                self.name,
                self.doc_count()
            ))
        })
    }

    fn index_of(&self, field: &str) -> Result<usize> {
        self.field_index(field).map(usize::from).ok_or_else(|| {
            MergeError::not_found(format!("field '{field}' in pack '{}'", self.name))
        })
    }

    pub fn get(&self, doc_id: u32, field: &str) -> Result<Option<AttributeValue>> {
        let idx = self.index_of(field)?;
        let bytes = self.blob(doc_id)?.read().clone();
        let mut blob = decode(&bytes)?;
        Ok(blob.get_mut(idx).and_then(Option::take))
    }

    /// All member values of a document.
    pub fn get_all(&self, doc_id: u32) -> Result<PackBlob> {
        let bytes = self.blob(doc_id)?.read().clone();
        decode(&bytes)
    }

    /// Replace one member. The blob is re-encoded and swapped whole.
    pub fn update(&self, doc_id: u32, field: &str, value: AttributeValue) -> Result<()> {
        let idx = self.index_of(field)?;
        let slot = self.blob(doc_id)?;
        let mut guard = slot.write();
        let mut blob = decode(&guard)?;
        blob.resize(self.fields.len(), None);
        blob[idx] = Some(value);
        *guard = encode(&blob)?;
        drop(guard);
        self.dirty.lock().set(doc_id as usize, true);
        Ok(())
    }

    pub fn is_dirty(&self, doc_id: u32) -> bool {
        self.dirty.lock().get(doc_id as usize).unwrap_or(false)
    }

    pub fn dirty_docs(&self) -> Vec<u32> {
        self.dirty
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, dirty)| *dirty)
            .map(|(doc, _)| doc as u32)
            .collect()
    }

    pub fn clear_dirty(&self) {
        self.dirty.lock().clear();
    }

    pub fn memory_use(&self) -> u64 {
        let blobs: usize = self.blobs.iter().map(|b| b.read().len()).sum();
        (blobs + self.doc_count() as usize / 8) as u64
    }
}
