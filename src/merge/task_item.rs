//! Merge task items: the independently schedulable units of a merge plan.
//!
//! An item's checkpoint name is derived from its fields alone, so re-running
//! the same task finds the same checkpoints and skips finished work.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};

/// Kind of data a merge task item rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeType {
    DeletionMap,
    Summary,
    Index,
    Attribute,
    Pack,
    PrimaryKey,
}

impl MergeType {
    pub const ALL: [MergeType; 6] = [
        MergeType::DeletionMap,
        MergeType::Summary,
        MergeType::Index,
        MergeType::Attribute,
        MergeType::Pack,
        MergeType::PrimaryKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeType::DeletionMap => "deletionmap",
            MergeType::Summary => "summary",
            MergeType::Index => "index",
            MergeType::Attribute => "attribute",
            MergeType::Pack => "pack",
            MergeType::PrimaryKey => "primarykey",
        }
    }

    /// Whether the work of one item can be sharded across parallel sub-items.
    pub fn supports_parallel(&self) -> bool {
        matches!(self, MergeType::Index | MergeType::Summary)
    }

    /// Relative cost of rewriting one document.
    pub fn cost_weight(&self) -> f64 {
        match self {
            MergeType::Index => 1.0,
            MergeType::Summary => 0.5,
            MergeType::PrimaryKey => 0.4,
            MergeType::Pack => 0.3,
            MergeType::Attribute => 0.2,
            MergeType::DeletionMap => 0.01,
        }
    }
}

impl fmt::Display for MergeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeType {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        MergeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MergeError::configuration(format!("unknown merge type: {s}")))
    }
}

/// One shard of a parallelized item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelMergeItem {
    #[serde(rename = "id")]
    pub id: u32,
    #[serde(rename = "totalCount")]
    pub total_count: u32,
    #[serde(rename = "dataRatio")]
    pub data_ratio: f64,
    #[serde(rename = "resourceIds", default)]
    pub resource_ids: Vec<u32>,
}

impl Default for ParallelMergeItem {
    fn default() -> Self {
        ParallelMergeItem {
            id: 0,
            total_count: 1,
            data_ratio: 1.0,
            resource_ids: Vec::new(),
        }
    }
}

impl ParallelMergeItem {
    pub fn new(id: u32, total_count: u32) -> Self {
        ParallelMergeItem {
            id,
            total_count,
            data_ratio: 1.0 / total_count.max(1) as f64,
            resource_ids: Vec::new(),
        }
    }

    /// Whether the item is actually one of several shards.
    pub fn is_sharded(&self) -> bool {
        self.total_count > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTaskItem {
    #[serde(rename = "MergePlanId")]
    pub merge_plan_id: usize,
    #[serde(rename = "MergeType")]
    pub merge_type: MergeType,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IsSubItem", default)]
    pub is_sub_item: bool,
    #[serde(rename = "Cost", default)]
    pub cost: f64,
    #[serde(rename = "ParallelMergeItem", default)]
    pub parallel_merge_item: ParallelMergeItem,
    #[serde(rename = "TargetSegmentIdx", default)]
    pub target_segment_idx: usize,
}

impl MergeTaskItem {
    pub fn new(merge_plan_id: usize, merge_type: MergeType, name: impl Into<String>) -> Self {
        MergeTaskItem {
            merge_plan_id,
            merge_type,
            name: name.into(),
            is_sub_item: false,
            cost: 0.0,
            parallel_merge_item: ParallelMergeItem::default(),
            target_segment_idx: 0,
        }
    }

    pub fn with_target(mut self, target_segment_idx: usize) -> Self {
        self.target_segment_idx = target_segment_idx;
        self
    }

    pub fn with_sub_item(mut self, is_sub_item: bool) -> Self {
        self.is_sub_item = is_sub_item;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelMergeItem) -> Self {
        self.parallel_merge_item = parallel;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn checkpoint_name(&self) -> String {
        checkpoint_name(self)
    }
}

impl fmt::Display for MergeTaskItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = checkpoint_name(self);
        f.write_str(name.trim_end_matches(CHECKPOINT_SUFFIX))
    }
}

const CHECKPOINT_SUFFIX: &str = ".checkpoint";

/// Checkpoint file name of an item:
/// `MergePlan_<plan>_<type>_<name>[-<total>-<id>]_<target>[_sub].checkpoint`.
///
/// The shard suffix is only present for items split into several shards.
/// `-` and `%` in the item name are percent-escaped, so a `-` always starts
/// the shard suffix.
pub fn checkpoint_name(item: &MergeTaskItem) -> String {
    let mut name = format!(
        "MergePlan_{}_{}_{}",
        item.merge_plan_id,
        item.merge_type,
        escape_name(&item.name)
    );
    let parallel = &item.parallel_merge_item;
    if parallel.is_sharded() {
        name.push_str(&format!("-{}-{}", parallel.total_count, parallel.id));
    }
    name.push_str(&format!("_{}", item.target_segment_idx));
    if item.is_sub_item {
        name.push_str("_sub");
    }
    name.push_str(CHECKPOINT_SUFFIX);
    name
}

fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '-' => escaped.push_str("%2D"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_name(escaped: &str) -> Option<String> {
    let mut name = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            name.push(c);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        match u8::from_str_radix(&hex, 16).ok().filter(|_| hex.len() == 2)? {
            b'%' => name.push('%'),
            b'-' => name.push('-'),
            _ => return None,
        }
    }
    Some(name)
}

static CHECKPOINT_NAME_RE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| {
        Regex::new(r"^MergePlan_(\d+)_([a-z]+)_([^-]*?)(?:-(\d+)-(\d+))?_(\d+)(_sub)?\.checkpoint$")
    });

/// Fields recovered from a checkpoint file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointName {
    pub merge_plan_id: usize,
    pub merge_type: MergeType,
    pub name: String,
    /// `(total_count, id)` of a sharded item.
    pub shard: Option<(u32, u32)>,
    pub target_segment_idx: usize,
    pub is_sub_item: bool,
}

impl CheckpointName {
    pub fn parse(file_name: &str) -> Result<Self> {
        let invalid = || MergeError::corrupt(format!("invalid checkpoint name: {file_name}"));
        let pattern = CHECKPOINT_NAME_RE
            .as_ref()
            .map_err(|e| MergeError::other(format!("checkpoint name pattern: {e}")))?;
        let caps = pattern.captures(file_name).ok_or_else(invalid)?;
        let number = |idx: usize| -> Result<u64> {
            caps.get(idx)
                .ok_or_else(invalid)?
                .as_str()
                .parse()
                .map_err(|_| invalid())
        };

        let narrow = |idx: usize| -> Result<u32> { u32::try_from(number(idx)?).map_err(|_| invalid()) };

        let shard = match (caps.get(4), caps.get(5)) {
            (Some(_), Some(_)) => Some((narrow(4)?, narrow(5)?)),
            _ => None,
        };
        Ok(CheckpointName {
            merge_plan_id: usize::try_from(number(1)?).map_err(|_| invalid())?,
            merge_type: caps[2].parse().map_err(|_| invalid())?,
            name: unescape_name(&caps[3]).ok_or_else(invalid)?,
            shard,
            target_segment_idx: usize::try_from(number(6)?).map_err(|_| invalid())?,
            is_sub_item: caps.get(7).is_some(),
        })
    }

    /// Whether the checkpoint belongs to `item`.
    pub fn matches(&self, item: &MergeTaskItem) -> bool {
        let parallel = &item.parallel_merge_item;
        let shard = parallel
            .is_sharded()
            .then_some((parallel.total_count, parallel.id));
        self.merge_plan_id == item.merge_plan_id
            && self.merge_type == item.merge_type
            && self.name == item.name
            && self.shard == shard
            && self.target_segment_idx == item.target_segment_idx
            && self.is_sub_item == item.is_sub_item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_name_plain() {
        let item = MergeTaskItem::new(3, MergeType::Attribute, "price").with_target(1);
        assert_eq!(
            item.checkpoint_name(),
            "MergePlan_3_attribute_price_1.checkpoint"
        );
    }

    #[test]
    fn test_checkpoint_name_sharded_sub_item() {
        let item = MergeTaskItem::new(0, MergeType::Index, "title")
            .with_parallel(ParallelMergeItem::new(2, 4))
            .with_sub_item(true);
        assert_eq!(
            item.checkpoint_name(),
            "MergePlan_0_index_title-4-2_0_sub.checkpoint"
        );
    }

    #[test]
    fn test_checkpoint_name_ignores_cost_and_resources() {
        let mut a = MergeTaskItem::new(1, MergeType::Summary, "summary");
        let mut b = a.clone();
        a.cost = 10.0;
        b.parallel_merge_item.resource_ids = vec![7];
        assert_eq!(a.checkpoint_name(), b.checkpoint_name());
    }

    #[test]
    fn test_parse_checkpoint_name() {
        let item = MergeTaskItem::new(12, MergeType::Index, "body_text")
            .with_parallel(ParallelMergeItem::new(1, 3))
            .with_target(2)
            .with_sub_item(true);
        let parsed = CheckpointName::parse(&item.checkpoint_name()).unwrap();
        assert_eq!(parsed.merge_plan_id, 12);
        assert_eq!(parsed.merge_type, MergeType::Index);
        assert_eq!(parsed.name, "body_text");
        assert_eq!(parsed.shard, Some((3, 1)));
        assert_eq!(parsed.target_segment_idx, 2);
        assert!(parsed.is_sub_item);
        assert!(parsed.matches(&item));

        let plain = MergeTaskItem::new(0, MergeType::DeletionMap, "deletionmap");
        let parsed = CheckpointName::parse(&plain.checkpoint_name()).unwrap();
        assert_eq!(parsed.shard, None);
        assert!(!parsed.is_sub_item);
        assert!(parsed.matches(&plain));
        assert!(!parsed.matches(&item));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CheckpointName::parse("MergePlan_x_index_a_0.checkpoint").is_err());
        assert!(CheckpointName::parse("MergePlan_0_bogus_a_0.checkpoint").is_err());
        assert!(CheckpointName::parse("task.json").is_err());
    }

    #[test]
    fn test_names_ending_like_shards_round_trip() {
        let plain = MergeTaskItem::new(0, MergeType::Index, "title-2-1");
        assert_eq!(
            plain.checkpoint_name(),
            "MergePlan_0_index_title%2D2%2D1_0.checkpoint"
        );
        let parsed = CheckpointName::parse(&plain.checkpoint_name()).unwrap();
        assert_eq!(parsed.name, "title-2-1");
        assert_eq!(parsed.shard, None);
        assert!(parsed.matches(&plain));

        let sharded = MergeTaskItem::new(0, MergeType::Index, "50%-off_2")
            .with_parallel(ParallelMergeItem::new(1, 3));
        let parsed = CheckpointName::parse(&sharded.checkpoint_name()).unwrap();
        assert_eq!(parsed.name, "50%-off_2");
        assert_eq!(parsed.shard, Some((3, 1)));
        assert!(parsed.matches(&sharded));
        assert!(!parsed.matches(&plain));
    }

    #[test]
    fn test_parse_rejects_out_of_range_numbers() {
        assert!(matches!(
            CheckpointName::parse("MergePlan_0_index_a-4294967296-0_0.checkpoint"),
            Err(MergeError::CorruptData(_))
        ));
        assert!(matches!(
            CheckpointName::parse("MergePlan_0_index_a%2_0.checkpoint"),
            Err(MergeError::CorruptData(_))
        ));
        assert!(matches!(
            CheckpointName::parse("MergePlan_0_index_a-1-2-3-4_0.checkpoint"),
            Err(MergeError::CorruptData(_))
        ));
    }

    #[test]
    fn test_item_json_field_names() {
        let item = MergeTaskItem::new(0, MergeType::PrimaryKey, "pk").with_cost(2.5);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["MergePlanId"], 0);
        assert_eq!(json["MergeType"], "primarykey");
        assert_eq!(json["Name"], "pk");
        assert_eq!(json["IsSubItem"], false);
        assert_eq!(json["Cost"], 2.5);
        assert_eq!(json["ParallelMergeItem"]["totalCount"], 1);
        assert_eq!(json["ParallelMergeItem"]["dataRatio"], 1.0);
        assert_eq!(json["TargetSegmentIdx"], 0);

        let back: MergeTaskItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_merge_type_from_str() {
        assert_eq!("pack".parse::<MergeType>().unwrap(), MergeType::Pack);
        assert!("inverted".parse::<MergeType>().is_err());
        assert!(MergeType::Index.supports_parallel());
        assert!(!MergeType::Attribute.supports_parallel());
    }
}
