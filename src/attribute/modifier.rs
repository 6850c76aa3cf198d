//! Attribute modifiers: apply post-build field updates.
//!
//! [`InPlaceAttributeModifier`] writes straight into the columns of a segment
//! that is still open. [`PatchAttributeModifier`] buffers updates to a built
//! segment and dumps them as a new patch generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attribute::column::AttributeSegment;
use crate::attribute::patch::{PatchKind, PatchRecord, PatchTarget};
use crate::attribute::value::AttributeValue;
use crate::error::{MergeError, Result};
use crate::resource::{ResourceMetricsProvider, ResourceSnapshot};
use crate::segment::{DocId, SegmentId};
use crate::storage::Storage;

/// Applies field updates addressed by global doc id.
pub trait AttributeModifier: Send + Sync {
    /// Update `field` of `doc_id`. `Ok(false)` if the field is not an
    /// updatable attribute of this segment. A doc id outside the segment is
    /// a [`MergeError::Logic`] and leaves everything untouched.
    fn update(&self, doc_id: DocId, field: &str, value: AttributeValue) -> Result<bool>;
}

fn local_doc_id(segment_id: SegmentId, base_doc_id: DocId, doc_count: u32, doc_id: DocId) -> Result<u32> {
    doc_id
        .checked_sub(base_doc_id)
        .filter(|local| *local < doc_count)
        .ok_or_else(|| {
            MergeError::logic(format!(
                "doc {doc_id} is outside segment {segment_id} [{base_doc_id}, {})",
                base_doc_id as u64 + doc_count as u64
            ))
        })
}

pub struct InPlaceAttributeModifier {
    base_doc_id: DocId,
    segment: Arc<AttributeSegment>,
}

impl InPlaceAttributeModifier {
    pub fn new(base_doc_id: DocId, segment: Arc<AttributeSegment>) -> Self {
        InPlaceAttributeModifier {
            base_doc_id,
            segment,
        }
    }

    pub fn segment(&self) -> &Arc<AttributeSegment> {
        &self.segment
    }
}

impl AttributeModifier for InPlaceAttributeModifier {
    fn update(&self, doc_id: DocId, field: &str, value: AttributeValue) -> Result<bool> {
        let local = local_doc_id(
            self.segment.segment_id(),
            self.base_doc_id,
            self.segment.doc_count(),
            doc_id,
        )?;
        if let Some(column) = self.segment.column(field) {
            column.set(local, &value)?;
            return Ok(true);
        }
        if let Some(pack) = self.segment.pack_of(field) {
            pack.update(local, field, value)?;
            return Ok(true);
        }
        log::debug!(
            "segment {} has no attribute '{field}', update ignored",
            self.segment.segment_id()
        );
        Ok(false)
    }
}

impl ResourceMetricsProvider for InPlaceAttributeModifier {
    fn resource_snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            current_memory_use: self.segment.memory_use(),
            ..Default::default()
        }
    }
}

/// Where updates of a field are recorded: a plain attribute or a pack member.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PatchSlot {
    kind: PatchKind,
    name: String,
    field_idx: u16,
}

type PatchKey = (PatchKind, String);
type PatchUpdates = BTreeMap<(u32, u16), AttributeValue>;
type PendingPatches = HashMap<PatchKey, PatchUpdates>;

/// Buffers updates to a built segment as patches.
pub struct PatchAttributeModifier {
    segment_id: SegmentId,
    base_doc_id: DocId,
    doc_count: u32,
    slots: HashMap<String, PatchSlot>,
    pending: Mutex<PendingPatches>,
}

impl PatchAttributeModifier {
    pub fn new(segment_id: SegmentId, base_doc_id: DocId, doc_count: u32) -> Self {
        PatchAttributeModifier {
            segment_id,
            base_doc_id,
            doc_count,
            slots: HashMap::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Accept updates for a plain attribute.
    pub fn with_attribute(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.slots.insert(
            field.clone(),
            PatchSlot {
                kind: PatchKind::Attribute,
                name: field,
                field_idx: 0,
            },
        );
        self
    }

    /// Accept updates for every member of a pack.
    pub fn with_pack(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        let name = name.into();
        for (idx, field) in fields.iter().enumerate() {
            self.slots.insert(
                field.to_string(),
                PatchSlot {
                    kind: PatchKind::Pack,
                    name: name.clone(),
                    field_idx: idx as u16,
                },
            );
        }
        self
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(|p| p.len()).sum()
    }

    /// Write buffered updates as the next generation of each touched field
    /// and clear the buffer. Returns the files written.
    ///
    /// On failure the fields written so far stay written and every other
    /// field keeps its updates buffered for the next dump.
    pub fn dump(&self, storage: &dyn Storage) -> Result<Vec<String>> {
        let mut pending: Vec<(PatchKey, PatchUpdates)> =
            std::mem::take(&mut *self.pending.lock()).into_iter().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut written = Vec::new();
        let mut remaining = pending.into_iter();
        while let Some((key, updates)) = remaining.next() {
            match self.write_generation(storage, &key, &updates) {
                Ok(file) => written.push(file),
                Err(e) => {
                    let restored = self.restore(std::iter::once((key, updates)).chain(remaining));
                    log::warn!(
                        "segment {}: patch dump failed after {} files, {restored} updates kept: {e}",
                        self.segment_id,
                        written.len()
                    );
                    return Err(e);
                }
            }
        }
        written.sort();
        log::debug!(
            "segment {}: dumped {} patch files",
            self.segment_id,
            written.len()
        );
        Ok(written)
    }

    fn write_generation(&self, storage: &dyn Storage, key: &PatchKey, updates: &PatchUpdates) -> Result<String> {
        let (kind, name) = key;
        let target = PatchTarget::new(*kind, self.segment_id, name.as_str());
        let generation = target.next_generation(storage)?;
        let records = updates
            .iter()
            .map(|(&(doc, idx), value)| PatchRecord::new(doc, idx, value.clone()))
            .collect();
        target.write(storage, generation, records)?;
        Ok(target.file_name(generation))
    }

    /// Buffer unwritten updates again. Updates that arrived during the dump
    /// are newer and are kept.
    fn restore(&self, unwritten: impl Iterator<Item = (PatchKey, PatchUpdates)>) -> usize {
        let mut pending = self.pending.lock();
        let mut restored = 0;
        for (key, updates) in unwritten {
            let slot = pending.entry(key).or_default();
            for (doc, value) in updates {
                slot.entry(doc).or_insert(value);
                restored += 1;
            }
        }
        restored
    }
}

impl AttributeModifier for PatchAttributeModifier {
    fn update(&self, doc_id: DocId, field: &str, value: AttributeValue) -> Result<bool> {
        let local = local_doc_id(self.segment_id, self.base_doc_id, self.doc_count, doc_id)?;
        let Some(slot) = self.slots.get(field) else {
            return Ok(false);
        };
        self.pending
            .lock()
            .entry((slot.kind, slot.name.clone()))
            .or_default()
            .insert((local, slot.field_idx), value);
        Ok(true)
    }
}

impl ResourceMetricsProvider for PatchAttributeModifier {
    fn resource_snapshot(&self) -> ResourceSnapshot {
        const RECORD_OVERHEAD: u64 = 48;
        let pending = self.pending_count() as u64;
        ResourceSnapshot {
            current_memory_use: pending * RECORD_OVERHEAD,
            dump_temp_memory_size: pending * RECORD_OVERHEAD,
            dump_expand_memory_size: 0,
            dump_file_size: pending * 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::column::AttributeColumn;
    use crate::attribute::pack::PackAttribute;
    use crate::attribute::value::AttributeType;
    use crate::storage::{MemoryStorage, StorageInput, StorageOutput};

    /// Memory storage that refuses to create files under `fail_prefix`.
    #[derive(Debug, Default)]
    struct FailingStorage {
        inner: MemoryStorage,
        fail_prefix: Mutex<Option<String>>,
    }

    impl Storage for FailingStorage {
        fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            if let Some(prefix) = self.fail_prefix.lock().as_deref()
                && name.starts_with(prefix)
            {
                return Err(MergeError::storage(format!("no space left writing {name}")));
            }
            self.inner.create_output(name)
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }

        fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_file(old_name, new_name)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    fn segment() -> Arc<AttributeSegment> {
        let mut segment = AttributeSegment::new(2, 4);
        segment
            .add_column("price", AttributeColumn::new("price", AttributeType::Int, 4).unwrap())
            .unwrap();
        segment
            .add_pack(PackAttribute::new("pack0", vec!["color".into()], 4).unwrap())
            .unwrap();
        Arc::new(segment)
    }

    #[test]
    fn test_in_place_update() {
        let modifier = InPlaceAttributeModifier::new(10, segment());
        assert!(modifier.update(11, "price", AttributeValue::Int(5)).unwrap());
        assert!(
            modifier
                .update(13, "color", AttributeValue::Str("blue".into()))
                .unwrap()
        );
        assert!(!modifier.update(12, "unknown", AttributeValue::Int(1)).unwrap());

        let segment = modifier.segment();
        assert_eq!(
            segment.get("price", 1).unwrap(),
            Some(AttributeValue::Int(5))
        );
        assert_eq!(segment.pack("pack0").unwrap().dirty_docs(), vec![3]);
        assert!(modifier.resource_snapshot().current_memory_use > 0);
    }

    #[test]
    fn test_out_of_range_is_logic_error() {
        let modifier = InPlaceAttributeModifier::new(10, segment());
        assert!(matches!(
            modifier.update(14, "price", AttributeValue::Int(1)),
            Err(MergeError::Logic(_))
        ));
        assert!(matches!(
            modifier.update(9, "price", AttributeValue::Int(1)),
            Err(MergeError::Logic(_))
        ));
        // The failed update leaves the next one unaffected.
        assert!(modifier.update(10, "price", AttributeValue::Int(1)).unwrap());
    }

    #[test]
    fn test_patch_modifier_dumps_generations() {
        let storage = MemoryStorage::new();
        let modifier = PatchAttributeModifier::new(2, 100, 10)
            .with_attribute("price")
            .with_pack("pack0", &["color", "size"]);

        modifier.update(101, "price", AttributeValue::Int(1)).unwrap();
        modifier.update(101, "price", AttributeValue::Int(2)).unwrap();
        modifier.update(105, "size", AttributeValue::Int(9)).unwrap();
        assert!(!modifier.update(105, "weight", AttributeValue::Int(9)).unwrap());
        assert!(modifier.update(110, "price", AttributeValue::Int(1)).is_err());
        assert_eq!(modifier.pending_count(), 2);

        let files = modifier.dump(&storage).unwrap();
        assert_eq!(
            files,
            vec![
                "segment_2/attribute/price/0.patch".to_string(),
                "segment_2/pack/pack0/0.patch".to_string(),
            ]
        );
        assert_eq!(modifier.pending_count(), 0);

        modifier.update(100, "price", AttributeValue::Int(3)).unwrap();
        let files = modifier.dump(&storage).unwrap();
        assert_eq!(files, vec!["segment_2/attribute/price/1.patch".to_string()]);

        let pack = PatchTarget::new(PatchKind::Pack, 2, "pack0");
        assert_eq!(
            pack.read(&storage, 0).unwrap(),
            vec![PatchRecord::new(5, 1, AttributeValue::Int(9))]
        );
    }

    #[test]
    fn test_failed_dump_keeps_unwritten_updates() {
        let storage = FailingStorage {
            fail_prefix: Mutex::new(Some("segment_2/pack/".to_string())),
            ..FailingStorage::default()
        };
        let modifier = PatchAttributeModifier::new(2, 100, 10)
            .with_attribute("price")
            .with_pack("pack0", &["color", "size"]);
        modifier.update(101, "price", AttributeValue::Int(1)).unwrap();
        modifier.update(105, "size", AttributeValue::Int(9)).unwrap();
        modifier
            .update(106, "color", AttributeValue::Str("red".into()))
            .unwrap();

        assert!(matches!(modifier.dump(&storage), Err(MergeError::Storage(_))));
        assert!(storage.file_exists("segment_2/attribute/price/0.patch"));
        assert!(!storage.file_exists("segment_2/pack/pack0/0.patch"));
        assert_eq!(modifier.pending_count(), 2);

        modifier.update(105, "size", AttributeValue::Int(10)).unwrap();
        *storage.fail_prefix.lock() = None;
        let files = modifier.dump(&storage).unwrap();
        assert_eq!(files, vec!["segment_2/pack/pack0/0.patch".to_string()]);
        assert_eq!(modifier.pending_count(), 0);
        assert_eq!(
            PatchTarget::new(PatchKind::Pack, 2, "pack0")
                .read(&storage, 0)
                .unwrap(),
            vec![
                PatchRecord::new(5, 1, AttributeValue::Int(10)),
                PatchRecord::new(6, 0, AttributeValue::Str("red".into())),
            ]
        );
    }
}
