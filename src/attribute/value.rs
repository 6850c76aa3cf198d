//! Attribute values and types.

use std::cmp::Ordering;
use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};

/// Bincode settings of value and pack blobs: fixed-width integers, and a
/// blob must be consumed exactly.
pub(crate) fn blob_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Type of an attribute field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Int,
    #[serde(rename = "uint")]
    UInt,
    Double,
    Str,
    MultiInt,
}

impl AttributeType {
    /// Fixed-length fields are stored as one 64-bit word per document.
    pub fn is_fixed_length(self) -> bool {
        matches!(self, AttributeType::Int | AttributeType::UInt | AttributeType::Double)
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Int(i64),
    #[serde(rename = "uint")]
    UInt(u64),
    Double(f64),
    Str(String),
    MultiInt(Vec<i64>),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            AttributeValue::Int(_) => AttributeType::Int,
            AttributeValue::UInt(_) => AttributeType::UInt,
            AttributeValue::Double(_) => AttributeType::Double,
            AttributeValue::Str(_) => AttributeType::Str,
            AttributeValue::MultiInt(_) => AttributeType::MultiInt,
        }
    }

    /// Bit pattern of a fixed-length value.
    pub fn to_fixed_bits(&self) -> Option<u64> {
        match self {
            AttributeValue::Int(v) => Some(*v as u64),
            AttributeValue::UInt(v) => Some(*v),
            AttributeValue::Double(v) => Some(v.to_bits()),
            _ => None,
        }
    }

    /// Inverse of [`Self::to_fixed_bits`].
    pub fn from_fixed_bits(attribute_type: AttributeType, bits: u64) -> Result<Self> {
        match attribute_type {
            AttributeType::Int => Ok(AttributeValue::Int(bits as i64)),
            AttributeType::UInt => Ok(AttributeValue::UInt(bits)),
            AttributeType::Double => Ok(AttributeValue::Double(f64::from_bits(bits))),
            other => Err(MergeError::logic(format!(
                "{other:?} is not a fixed-length attribute type"
            ))),
        }
    }

    /// Encoded form of a variable-length value.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        blob_codec()
            .serialize(self)
            .map_err(|e| MergeError::internal(format!("encode value: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        blob_codec()
            .deserialize(bytes)
            .map_err(|e| MergeError::corrupt(format!("decode value: {e}")))
    }

    fn type_rank(&self) -> u8 {
        match self {
            AttributeValue::Int(_) => 0,
            AttributeValue::UInt(_) => 1,
            AttributeValue::Double(_) => 2,
            AttributeValue::Str(_) => 3,
            AttributeValue::MultiInt(_) => 4,
        }
    }

    /// Total order used for sorting. Values of different types order by type.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (AttributeValue::Int(a), AttributeValue::Int(b)) => a.cmp(b),
            (AttributeValue::UInt(a), AttributeValue::UInt(b)) => a.cmp(b),
            (AttributeValue::Double(a), AttributeValue::Double(b)) => a.total_cmp(b),
            (AttributeValue::Str(a), AttributeValue::Str(b)) => a.cmp(b),
            (AttributeValue::MultiInt(a), AttributeValue::MultiInt(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::UInt(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::Str(v) => f.write_str(v),
            AttributeValue::MultiInt(values) => {
                let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", joined.join(","))
            }
        }
    }
}
