//! In-memory attribute columns of an open segment.
//!
//! Fixed-length values live in one `AtomicU64` per document and are updated
//! in place. Variable-length values are immutable byte slices behind an
//! `Arc`; an update encodes a new slice and swaps the pointer, so a reader
//! keeps whatever version it cloned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::attribute::pack::PackAttribute;
use crate::attribute::value::{AttributeType, AttributeValue};
use crate::error::{MergeError, Result};
use crate::reclaim::AttributeSource;
use crate::segment::SegmentId;

fn out_of_range(field: &str, doc_id: u32, doc_count: u32) -> MergeError {
    MergeError::logic(format!(
        "doc {doc_id} outside attribute '{field}' range [0, {doc_count})"
    ))
}

fn type_mismatch(field: &str, expected: AttributeType, value: &AttributeValue) -> MergeError {
    MergeError::logic(format!(
        "attribute '{field}' holds {expected:?}, got {:?}",
        value.attribute_type()
    ))
}

#[derive(Debug)]
pub struct FixedAttributeColumn {
    field: String,
    attribute_type: AttributeType,
    values: Box<[AtomicU64]>,
}

impl FixedAttributeColumn {
    pub fn new(field: impl Into<String>, attribute_type: AttributeType, doc_count: u32) -> Self {
        FixedAttributeColumn {
            field: field.into(),
            attribute_type,
            values: (0..doc_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.values.len() as u32
    }

    fn slot(&self, doc_id: u32) -> Result<&AtomicU64> {
        self.values
            .get(doc_id as usize)
            .ok_or_else(|| out_of_range(&self.field, doc_id, self.doc_count()))
    }

    pub fn get(&self, doc_id: u32) -> Result<AttributeValue> {
        let bits = self.slot(doc_id)?.load(Ordering::Acquire);
        AttributeValue::from_fixed_bits(self.attribute_type, bits)
    }

    pub fn set(&self, doc_id: u32, value: &AttributeValue) -> Result<()> {
        if value.attribute_type() != self.attribute_type {
            return Err(type_mismatch(&self.field, self.attribute_type, value));
        }
        let bits = value
            .to_fixed_bits()
            .ok_or_else(|| type_mismatch(&self.field, self.attribute_type, value))?;
        self.slot(doc_id)?.store(bits, Ordering::Release);
        Ok(())
    }

    pub fn memory_use(&self) -> u64 {
        (self.values.len() * std::mem::size_of::<AtomicU64>()) as u64
    }
}

#[derive(Debug)]
pub struct VarAttributeColumn {
    field: String,
    attribute_type: AttributeType,
    values: Box<[RwLock<Arc<[u8]>>]>,
}

impl VarAttributeColumn {
    pub fn new(field: impl Into<String>, attribute_type: AttributeType, doc_count: u32) -> Result<Self> {
        let empty: Arc<[u8]> = match attribute_type {
            AttributeType::Str => AttributeValue::Str(String::new()).to_bytes()?,
            _ => AttributeValue::MultiInt(Vec::new()).to_bytes()?,
        }
        .into();
        Ok(VarAttributeColumn {
            field: field.into(),
            attribute_type,
            values: (0..doc_count).map(|_| RwLock::new(empty.clone())).collect(),
        })
    }

    pub fn doc_count(&self) -> u32 {
        self.values.len() as u32
    }

    fn slot(&self, doc_id: u32) -> Result<&RwLock<Arc<[u8]>>> {
        self.values
            .get(doc_id as usize)
            .ok_or_else(|| out_of_range(&self.field, doc_id, self.doc_count()))
    }

    /// Encoded value; stays valid across later updates.
    pub fn get_bytes(&self, doc_id: u32) -> Result<Arc<[u8]>> {
        Ok(self.slot(doc_id)?.read().clone())
    }

    pub fn get(&self, doc_id: u32) -> Result<AttributeValue> {
        AttributeValue::from_bytes(&self.get_bytes(doc_id)?)
    }

    pub fn set(&self, doc_id: u32, value: &AttributeValue) -> Result<()> {
        if value.attribute_type() != self.attribute_type {
            return Err(type_mismatch(&self.field, self.attribute_type, value));
        }
        let slot = self.slot(doc_id)?;
        let encoded: Arc<[u8]> = value.to_bytes()?.into();
        *slot.write() = encoded;
        Ok(())
    }

    pub fn memory_use(&self) -> u64 {
        self.values
            .iter()
            .map(|slot| (slot.read().len() + std::mem::size_of::<RwLock<Arc<[u8]>>>()) as u64)
            .sum()
    }
}

/// One attribute field of a segment.
#[derive(Debug)]
pub enum AttributeColumn {
    Fixed(FixedAttributeColumn),
    Var(VarAttributeColumn),
}

impl AttributeColumn {
    pub fn new(field: impl Into<String>, attribute_type: AttributeType, doc_count: u32) -> Result<Self> {
        if attribute_type.is_fixed_length() {
            Ok(AttributeColumn::Fixed(FixedAttributeColumn::new(
                field,
                attribute_type,
                doc_count,
            )))
        } else {
            Ok(AttributeColumn::Var(VarAttributeColumn::new(
                field,
                attribute_type,
                doc_count,
            )?))
        }
    }

    /// Column filled from `values`, one per document.
    pub fn from_values(field: impl Into<String>, attribute_type: AttributeType, values: &[AttributeValue]) -> Result<Self> {
        let column = Self::new(field, attribute_type, values.len() as u32)?;
        for (doc_id, value) in values.iter().enumerate() {
            column.set(doc_id as u32, value)?;
        }
        Ok(column)
    }

    pub fn doc_count(&self) -> u32 {
        match self {
            AttributeColumn::Fixed(c) => c.doc_count(),
            AttributeColumn::Var(c) => c.doc_count(),
        }
    }

    pub fn get(&self, doc_id: u32) -> Result<AttributeValue> {
        match self {
            AttributeColumn::Fixed(c) => c.get(doc_id),
            AttributeColumn::Var(c) => c.get(doc_id),
        }
    }

    pub fn set(&self, doc_id: u32, value: &AttributeValue) -> Result<()> {
        match self {
            AttributeColumn::Fixed(c) => c.set(doc_id, value),
            AttributeColumn::Var(c) => c.set(doc_id, value),
        }
    }

    pub fn memory_use(&self) -> u64 {
        match self {
            AttributeColumn::Fixed(c) => c.memory_use(),
            AttributeColumn::Var(c) => c.memory_use(),
        }
    }
}

/// Attribute columns and packs of one segment.
#[derive(Debug)]
pub struct AttributeSegment {
    segment_id: SegmentId,
    doc_count: u32,
    columns: HashMap<String, AttributeColumn>,
    packs: HashMap<String, PackAttribute>,
}

impl AttributeSegment {
    pub fn new(segment_id: SegmentId, doc_count: u32) -> Self {
        AttributeSegment {
            segment_id,
            doc_count,
            columns: HashMap::new(),
            packs: HashMap::new(),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    pub fn add_column(&mut self, field: impl Into<String>, column: AttributeColumn) -> Result<()> {
        let field = field.into();
        if column.doc_count() != self.doc_count {
            return Err(MergeError::logic(format!(
                "column '{field}' has {} docs, segment {} has {}",
                column.doc_count(),
                self.segment_id,
                self.doc_count
            )));
        }
        self.columns.insert(field, column);
        Ok(())
    }

    pub fn add_pack(&mut self, pack: PackAttribute) -> Result<()> {
        if pack.doc_count() != self.doc_count {
            return Err(MergeError::logic(format!(
                "pack '{}' has {} docs, segment {} has {}",
                pack.name(),
                pack.doc_count(),
                self.segment_id,
                self.doc_count
            )));
        }
        self.packs.insert(pack.name().to_string(), pack);
        Ok(())
    }

    pub fn column(&self, field: &str) -> Option<&AttributeColumn> {
        self.columns.get(field)
    }

    pub fn pack(&self, name: &str) -> Option<&PackAttribute> {
        self.packs.get(name)
    }

    /// Pack holding `field`, if any.
    pub fn pack_of(&self, field: &str) -> Option<&PackAttribute> {
        self.packs.values().find(|p| p.field_index(field).is_some())
    }

    pub fn packs(&self) -> impl Iterator<Item = &PackAttribute> {
        self.packs.values()
    }

    /// Value of a plain or packed field.
    pub fn get(&self, field: &str, doc_id: u32) -> Result<Option<AttributeValue>> {
        if let Some(column) = self.columns.get(field) {
            return column.get(doc_id).map(Some);
        }
        match self.pack_of(field) {
            Some(pack) => pack.get(doc_id, field),
            None => Err(MergeError::not_found(format!(
                "attribute '{field}' of segment {}",
                self.segment_id
            ))),
        }
    }

    pub fn memory_use(&self) -> u64 {
        let columns: u64 = self.columns.values().map(|c| c.memory_use()).sum();
        let packs: u64 = self.packs.values().map(|p| p.memory_use()).sum();
        columns + packs
    }
}

/// Attribute segments by id; serves sort keys for sorted merges.
#[derive(Debug, Default, Clone)]
pub struct AttributeSegmentSet {
    segments: HashMap<SegmentId, Arc<AttributeSegment>>,
}

impl AttributeSegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, segment: Arc<AttributeSegment>) {
        self.segments.insert(segment.segment_id(), segment);
    }

    pub fn get(&self, segment_id: SegmentId) -> Option<&Arc<AttributeSegment>> {
        self.segments.get(&segment_id)
    }
}

impl AttributeSource for AttributeSegmentSet {
    fn value(&self, segment_id: SegmentId, local_doc_id: u32, field: &str) -> Result<Option<AttributeValue>> {
        self.segments
            .get(&segment_id)
            .ok_or_else(|| MergeError::not_found(format!("attribute segment {segment_id}")))?
            .get(field, local_doc_id)
    }
}
