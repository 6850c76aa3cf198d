//! Sort descriptions and sort key evaluation for sorted merges.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeValue;
use crate::error::{MergeError, Result};
use crate::segment::SegmentId;

/// Sort direction of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// One `(field, direction)` entry of a multi-key sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescription {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortDescription {
    pub fn new<S: Into<String>>(field: S, order: SortOrder) -> Self {
        SortDescription {
            field: field.into(),
            order,
        }
    }

    pub fn ascending<S: Into<String>>(field: S) -> Self {
        Self::new(field, SortOrder::Ascending)
    }

    pub fn descending<S: Into<String>>(field: S) -> Self {
        Self::new(field, SortOrder::Descending)
    }
}

impl fmt::Display for SortDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            SortOrder::Ascending => write!(f, "+{}", self.field),
            SortOrder::Descending => write!(f, "-{}", self.field),
        }
    }
}

/// Ordered list of sort keys, most significant first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SortDescriptions(pub Vec<SortDescription>);

impl SortDescriptions {
    /// Parse `+price;-timestamp;name`. A missing sign means ascending.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut descriptions = Vec::new();
        for part in pattern.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (order, field) = match part.as_bytes()[0] {
                b'+' => (SortOrder::Ascending, &part[1..]),
                b'-' => (SortOrder::Descending, &part[1..]),
                _ => (SortOrder::Ascending, part),
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(MergeError::configuration(format!(
                    "empty field name in sort pattern '{pattern}'"
                )));
            }
            descriptions.push(SortDescription::new(field, order));
        }
        Ok(SortDescriptions(descriptions))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SortDescription> {
        self.0.iter()
    }

    /// Compare two evaluated keys. Nulls sort last in either direction.
    pub fn compare(&self, left: &SortKey, right: &SortKey) -> Ordering {
        for (idx, description) in self.0.iter().enumerate() {
            let ordering = match (left.get(idx), right.get(idx)) {
                (Some(Some(a)), Some(Some(b))) => match description.order {
                    SortOrder::Ascending => a.total_cmp(b),
                    SortOrder::Descending => b.total_cmp(a),
                },
                (Some(Some(_)), _) => Ordering::Less,
                (_, Some(Some(_))) => Ordering::Greater,
                _ => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for SortDescriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        f.write_str(&parts.join(";"))
    }
}

/// Evaluated sort key of one document; `None` entries are nulls.
pub type SortKey = Vec<Option<AttributeValue>>;

/// Attribute values by segment-local doc id, used to evaluate sort keys.
pub trait AttributeSource: Send + Sync {
    /// Value of `field` for a document, `Ok(None)` for null.
    fn value(&self, segment_id: SegmentId, local_doc_id: u32, field: &str)
    -> Result<Option<AttributeValue>>;
}

/// Evaluate the full sort key of a document.
pub fn evaluate_sort_key(
    source: &dyn AttributeSource,
    descriptions: &SortDescriptions,
    segment_id: SegmentId,
    local_doc_id: u32,
) -> Result<SortKey> {
    descriptions
        .iter()
        .map(|d| source.value(segment_id, local_doc_id, &d.field))
        .collect()
}

/// An [`AttributeSource`] over in-memory columns.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAttributeSource {
    columns: HashMap<(SegmentId, String), Vec<Option<AttributeValue>>>,
}

impl InMemoryAttributeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the values of a field for a whole segment.
    pub fn insert_column<S: Into<String>>(
        &mut self,
        segment_id: SegmentId,
        field: S,
        values: Vec<Option<AttributeValue>>,
    ) {
        self.columns.insert((segment_id, field.into()), values);
    }

    /// Builder-style variant of [`Self::insert_column`].
    pub fn with_column<S: Into<String>>(
        mut self,
        segment_id: SegmentId,
        field: S,
        values: Vec<Option<AttributeValue>>,
    ) -> Self {
        self.insert_column(segment_id, field, values);
        self
    }
}

impl AttributeSource for InMemoryAttributeSource {
    fn value(
        &self,
        segment_id: SegmentId,
        local_doc_id: u32,
        field: &str,
    ) -> Result<Option<AttributeValue>> {
        let column = self
            .columns
            .get(&(segment_id, field.to_string()))
            .ok_or_else(|| {
                MergeError::not_found(format!("attribute '{field}' of segment {segment_id}"))
            })?;
        column.get(local_doc_id as usize).cloned().ok_or_else(|| {
            MergeError::logic(format!(
                "doc {local_doc_id} out of range for attribute '{field}' of segment {segment_id}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern() {
        let sort = SortDescriptions::parse("-price; +ts ;name").unwrap();
        assert_eq!(
            sort.0,
            vec![
                SortDescription::descending("price"),
                SortDescription::ascending("ts"),
                SortDescription::ascending("name"),
            ]
        );
        assert_eq!(sort.to_string(), "-price;+ts;+name");
        assert!(SortDescriptions::parse("+").is_err());
        assert!(SortDescriptions::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_compare_nulls_last_both_directions() {
        let int = |v| Some(AttributeValue::Int(v));
        for sort in [
            SortDescriptions(vec![SortDescription::ascending("a")]),
            SortDescriptions(vec![SortDescription::descending("a")]),
        ] {
            assert_eq!(sort.compare(&vec![int(5)], &vec![None]), Ordering::Less);
            assert_eq!(sort.compare(&vec![None], &vec![int(5)]), Ordering::Greater);
            assert_eq!(sort.compare(&vec![None], &vec![None]), Ordering::Equal);
        }
    }

    #[test]
    fn test_compare_multi_key() {
        let sort = SortDescriptions::parse("-a;+b").unwrap();
        let key = |a, b| vec![Some(AttributeValue::Int(a)), Some(AttributeValue::Int(b))];
        assert_eq!(sort.compare(&key(2, 9), &key(1, 0)), Ordering::Less);
        assert_eq!(sort.compare(&key(1, 1), &key(1, 2)), Ordering::Less);
        assert_eq!(sort.compare(&key(1, 2), &key(1, 2)), Ordering::Equal);
    }

    #[test]
    fn test_in_memory_source() {
        let source = InMemoryAttributeSource::new().with_column(
            3,
            "price",
            vec![Some(AttributeValue::Int(10)), None],
        );
        assert_eq!(
            source.value(3, 0, "price").unwrap(),
            Some(AttributeValue::Int(10))
        );
        assert_eq!(source.value(3, 1, "price").unwrap(), None);
        assert!(matches!(source.value(3, 2, "price"), Err(MergeError::Logic(_))));
        assert!(matches!(source.value(4, 0, "price"), Err(MergeError::NotFound(_))));
    }
}
