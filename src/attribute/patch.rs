//! Attribute patch files.
//!
//! Updates to a built segment are recorded as patches instead of rewriting
//! the segment. Each incremental build writes one generation per
//! (segment, field); generations accumulate until a merge consolidates them.
//!
//! Layout: `segment_<id>/<attribute|pack>/<name>/<generation>.patch`, holding
//! `(doc id, member index, value)` records sorted by doc id. Patches of
//! sub documents live under `segment_<id>/sub_segment/`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::value::AttributeValue;
use crate::error::{MergeError, Result};
use crate::segment::SegmentId;
use crate::storage::{Storage, StructReader, StructWriter};

const PATCH_MAGIC: u32 = 0x5054_4348; // "PTCH"
const PATCH_VERSION: u32 = 1;
const PATCH_SUFFIX: &str = ".patch";

/// Whether a patch targets a plain attribute or a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Attribute,
    Pack,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchKind::Attribute => f.write_str("attribute"),
            PatchKind::Pack => f.write_str("pack"),
        }
    }
}

/// One recorded update. `field_idx` is the member index for packs and 0 for
/// plain attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRecord {
    pub doc_id: u32,
    pub field_idx: u16,
    pub value: AttributeValue,
}

impl PatchRecord {
    pub fn new(doc_id: u32, field_idx: u16, value: AttributeValue) -> Self {
        PatchRecord {
            doc_id,
            field_idx,
            value,
        }
    }
}

/// Patch location of one (segment, field).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchTarget {
    pub kind: PatchKind,
    pub segment_id: SegmentId,
    pub name: String,
    /// Field of the segment's sub documents.
    pub sub_segment: bool,
}

impl PatchTarget {
    pub fn new(kind: PatchKind, segment_id: SegmentId, name: impl Into<String>) -> Self {
        PatchTarget {
            kind,
            segment_id,
            name: name.into(),
            sub_segment: false,
        }
    }

    /// A field of the sub documents joined to `segment_id`.
    pub fn sub(kind: PatchKind, segment_id: SegmentId, name: impl Into<String>) -> Self {
        PatchTarget {
            sub_segment: true,
            ..Self::new(kind, segment_id, name)
        }
    }

    pub fn directory(&self) -> String {
        let sub = if self.sub_segment { "sub_segment/" } else { "" };
        format!("segment_{}/{sub}{}/{}/", self.segment_id, self.kind, self.name)
    }

    pub fn file_name(&self, generation: u64) -> String {
        format!("{}{generation}{PATCH_SUFFIX}", self.directory())
    }

    /// Generations present in storage, oldest first.
    pub fn generations(&self, storage: &dyn Storage) -> Result<Vec<u64>> {
        let dir = self.directory();
        let mut generations: Vec<u64> = storage
            .list_files_with_prefix(&dir)?
            .iter()
            .filter_map(|file| {
                let rest = &file[dir.len()..];
                rest.strip_suffix(PATCH_SUFFIX)?.parse().ok()
            })
            .collect();
        generations.sort_unstable();
        Ok(generations)
    }

    pub fn next_generation(&self, storage: &dyn Storage) -> Result<u64> {
        Ok(self
            .generations(storage)?
            .last()
            .map(|g| g + 1)
            .unwrap_or(0))
    }

    /// Write one generation. Records are sorted by doc id; among records
    /// for the same (doc, member) the later one is kept.
    pub fn write(&self, storage: &dyn Storage, generation: u64, records: Vec<PatchRecord>) -> Result<usize> {
        let records = dedup_records(records);
        let name = self.file_name(generation);
        let temp_name = format!("{name}.tmp");
        let mut writer = StructWriter::new(storage.create_output(&temp_name)?);
        writer.write_header(PATCH_MAGIC, PATCH_VERSION)?;
        writer.write_varint(records.len() as u64)?;
        for record in &records {
            writer.write_varint(record.doc_id as u64)?;
            writer.write_u16(record.field_idx)?;
            writer.write_bytes(&record.value.to_bytes()?)?;
        }
        writer.close()?;
        storage.rename_file(&temp_name, &name)?;
        Ok(records.len())
    }

    pub fn read(&self, storage: &dyn Storage, generation: u64) -> Result<Vec<PatchRecord>> {
        read_patch_file(storage, &self.file_name(generation))
    }

    /// Remove every generation.
    pub fn delete_all(&self, storage: &dyn Storage) -> Result<()> {
        for generation in self.generations(storage)? {
            storage.delete_file(&self.file_name(generation))?;
        }
        Ok(())
    }
}

fn dedup_records(mut records: Vec<PatchRecord>) -> Vec<PatchRecord> {
    // Stable sort keeps the write order of equal keys.
    records.sort_by_key(|r| (r.doc_id, r.field_idx));
    let mut deduped: Vec<PatchRecord> = Vec::with_capacity(records.len());
    for record in records {
        match deduped.last_mut() {
            Some(last) if last.doc_id == record.doc_id && last.field_idx == record.field_idx => {
                *last = record;
            }
            _ => deduped.push(record),
        }
    }
    deduped
}

pub fn read_patch_file(storage: &dyn Storage, name: &str) -> Result<Vec<PatchRecord>> {
    let mut reader = StructReader::open(storage.open_input(name)?)?;
    reader.expect_header(PATCH_MAGIC, PATCH_VERSION)?;
    let count = reader.read_varint()? as usize;
    let mut records = Vec::with_capacity(count.min(1 << 16));
    let mut previous: Option<u32> = None;
    for _ in 0..count {
        let doc_id = u32::try_from(reader.read_varint()?)
            .map_err(|_| MergeError::corrupt(format!("{name}: doc id out of range")))?;
        if previous.is_some_and(|p| p > doc_id) {
            return Err(MergeError::corrupt(format!("{name}: records out of order")));
        }
        previous = Some(doc_id);
        let field_idx = reader.read_u16()?;
        let value = AttributeValue::from_bytes(&reader.read_bytes()?)?;
        records.push(PatchRecord::new(doc_id, field_idx, value));
    }
    if !reader.is_eof() {
        return Err(MergeError::corrupt(format!("{name}: trailing bytes")));
    }
    Ok(records)
}
