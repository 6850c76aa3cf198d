//! Merge configuration and strategy parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::reclaim::SortDescriptions;
use crate::resource::ResourceQuota;
use crate::segment::SegmentId;

/// Parameters shared by the merge strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStrategyParameter {
    /// Cap on live docs of a merged segment; bigger segments are left alone.
    pub max_doc_count: u32,
    /// Optimize splits its output when total live docs exceed this.
    pub after_merge_max_doc_count: u32,
    /// Upper bound on the number of segments an optimize split produces.
    pub after_merge_max_segment_count: u32,
    /// Balance tree: same-layer segment count that triggers a merge.
    pub conflict_segment_count: u32,
    /// Balance tree: deleted-doc percentage that triggers a rewrite.
    pub conflict_delete_percent: u32,
    /// Balance tree: live doc count of the lowest layer.
    pub base_doc_count: u32,
    /// Top-layer segments above this many live docs are never rewritten.
    pub max_valid_doc_count: u32,
    /// Optimize leaves a single, deletion-free segment untouched.
    pub skip_single_merged_segment: bool,
}

impl Default for MergeStrategyParameter {
    fn default() -> Self {
        MergeStrategyParameter {
            max_doc_count: u32::MAX,
            after_merge_max_doc_count: u32::MAX,
            after_merge_max_segment_count: u32::MAX,
            conflict_segment_count: 3,
            conflict_delete_percent: 30,
            base_doc_count: 102_400,
            max_valid_doc_count: u32::MAX,
            skip_single_merged_segment: true,
        }
    }
}

impl MergeStrategyParameter {
    /// Parse the `key=value;key=value` form on top of the defaults.
    ///
    /// ```
    /// use segmerge::merge::MergeStrategyParameter;
    ///
    /// let params = MergeStrategyParameter::parse("conflict-segment-number=4;max_doc_count=1000").unwrap();
    /// assert_eq!(params.conflict_segment_count, 4);
    /// assert_eq!(params.max_doc_count, 1000);
    /// assert!(MergeStrategyParameter::parse("bogus=1").is_err());
    /// ```
    pub fn parse(params: &str) -> Result<Self> {
        let mut parsed = Self::default();
        for pair in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                MergeError::configuration(format!("expected key=value, got '{pair}'"))
            })?;
            parsed.set(key.trim(), value.trim())?;
        }
        parsed.validate()?;
        Ok(parsed)
    }

    /// Set one parameter by name. Legacy hyphenated names are accepted.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_doc_count" | "max-doc-count" => self.max_doc_count = parse_u32(key, value)?,
            "after_merge_max_doc_count" => self.after_merge_max_doc_count = parse_u32(key, value)?,
            "after_merge_max_segment_count" => {
                self.after_merge_max_segment_count = parse_u32(key, value)?
            }
            "conflict_segment_count" | "conflict-segment-number" => {
                self.conflict_segment_count = parse_u32(key, value)?
            }
            "conflict_delete_percent" | "conflict-delete-percent" => {
                self.conflict_delete_percent = parse_u32(key, value)?
            }
            "base_doc_count" | "base-doc-count" => self.base_doc_count = parse_u32(key, value)?,
            "max_valid_doc_count" => self.max_valid_doc_count = parse_u32(key, value)?,
            "skip_single_merged_segment" | "skip-single-merged-segment" => {
                self.skip_single_merged_segment = match value {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(MergeError::configuration(format!(
                            "{key} expects true or false, got '{value}'"
                        )));
                    }
                }
            }
            _ => {
                return Err(MergeError::configuration(format!(
                    "unknown merge strategy parameter '{key}'"
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.conflict_segment_count < 2 {
            return Err(MergeError::configuration(format!(
                "conflict_segment_count must be >= 2, got {}",
                self.conflict_segment_count
            )));
        }
        if self.conflict_delete_percent > 100 {
            return Err(MergeError::configuration(format!(
                "conflict_delete_percent must be within [0, 100], got {}",
                self.conflict_delete_percent
            )));
        }
        if self.after_merge_max_segment_count == 0 {
            return Err(MergeError::configuration(
                "after_merge_max_segment_count must be positive",
            ));
        }
        if self.max_doc_count == 0 || self.after_merge_max_doc_count == 0 || self.base_doc_count == 0
        {
            return Err(MergeError::configuration("doc count limits must be positive"));
        }
        Ok(())
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        MergeError::configuration(format!("{key} expects a non-negative integer, got '{value}'"))
    })
}

/// Which strategy plans the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    BalanceTree,
    Optimize,
    SpecificSegments,
}

impl std::str::FromStr for StrategyKind {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "balance_tree" | "balance-tree" => Ok(StrategyKind::BalanceTree),
            "optimize" => Ok(StrategyKind::Optimize),
            "specific_segments" | "specific-segments" => Ok(StrategyKind::SpecificSegments),
            other => Err(MergeError::configuration(format!("unknown merge strategy '{other}'"))),
        }
    }
}

/// Top-level merge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: StrategyKind,
    /// Strategy parameters in `key=value;...` form.
    pub strategy_params: String,
    /// Input segments of the specific-segments strategy.
    pub specific_segments: Vec<SegmentId>,
    /// Number of parallel sub-items per shardable item.
    pub parallel: u32,
    /// Worker threads; 0 means one per CPU.
    pub merge_threads: usize,
    pub resource_quota: ResourceQuota,
    pub sort_description: SortDescriptions,
    /// Keep reclaim maps after the Version commits.
    pub keep_reclaim_map: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            strategy: StrategyKind::BalanceTree,
            strategy_params: String::new(),
            specific_segments: Vec::new(),
            parallel: 1,
            merge_threads: 0,
            resource_quota: ResourceQuota::unlimited(),
            sort_description: SortDescriptions::default(),
            keep_reclaim_map: false,
        }
    }
}

impl MergeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MergeConfig = serde_json::from_str(json)
            .map_err(|e| MergeError::configuration(format!("invalid merge config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn strategy_parameter(&self) -> Result<MergeStrategyParameter> {
        MergeStrategyParameter::parse(&self.strategy_params)
    }

    /// Worker thread count with the CPU default applied.
    pub fn effective_threads(&self) -> usize {
        if self.merge_threads == 0 {
            num_cpus::get()
        } else {
            self.merge_threads
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy_parameter()?;
        if self.parallel == 0 {
            return Err(MergeError::configuration("parallel must be at least 1"));
        }
        if self.strategy == StrategyKind::SpecificSegments && self.specific_segments.is_empty() {
            return Err(MergeError::configuration(
                "specific_segments strategy needs at least one segment id",
            ));
        }
        Ok(())
    }
}
