//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, SegmergeArgs};
use crate::error::Result;
use crate::merge::MergeTaskItem;
use crate::primary_key::PrimaryKeyLoadPlan;
use crate::segment::{DocId, MergedSegment, SegmentId};

/// One plan of a merge task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: usize,
    pub segments: Vec<SegmentId>,
    pub target_level: u32,
    pub target_segment_count: usize,
    pub total_docs: u64,
    pub live_docs: u64,
}

/// Result of `plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub strategy: String,
    pub version_id: u64,
    pub plans: Vec<PlanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<MergeTaskItem>>,
}

/// Result of `reclaim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub segments: Vec<SegmentId>,
    pub new_doc_count: u32,
    pub deleted_doc_count: u32,
    pub target_doc_counts: Vec<u32>,
    /// `(old, new)` pairs; `None` for dropped documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Vec<(DocId, Option<DocId>)>>,
}

/// Result of `pk-plans`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkPlansReport {
    pub max_doc_count: u64,
    pub combine_segments: bool,
    pub plans: Vec<PrimaryKeyLoadPlan>,
}

/// Result of `merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub version_id: u64,
    pub merged_segments: Vec<MergedSegment>,
    pub plans_executed: usize,
    pub items_executed: usize,
    pub items_skipped: usize,
    pub docs_merged: u64,
    pub docs_reclaimed: u64,
    pub duration_ms: u64,
}

/// Output a result in the selected format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &SegmergeArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

fn output_human<T: Serialize>(message: &str, result: &T, args: &SegmergeArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }
    for line in human_lines(&serde_json::to_value(result)?, 0) {
        println!("{line}");
    }
    Ok(())
}

fn output_json<T: Serialize>(result: &T, args: &SegmergeArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Render a value as indented `key: value` lines. Arrays of objects are
/// listed entry by entry.
pub(crate) fn human_lines(value: &serde_json::Value, indent: usize) -> Vec<String> {
    let spaces = "  ".repeat(indent);
    let mut lines = Vec::new();
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    serde_json::Value::Array(arr) if arr.iter().any(|v| v.is_object()) => {
                        lines.push(format!("{spaces}{key}:"));
                        for (i, item) in arr.iter().enumerate() {
                            lines.push(format!("{spaces}  #{i}"));
                            lines.extend(human_lines(item, indent + 2));
                        }
                    }
                    serde_json::Value::Object(_) => {
                        lines.push(format!("{spaces}{key}:"));
                        lines.extend(human_lines(val, indent + 1));
                    }
                    _ => lines.push(format!("{spaces}{key}: {}", format_value(val))),
                }
            }
        }
        _ => lines.push(format!("{spaces}{}", format_value(value))),
    }
    lines
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_lines() {
        let report = ReclaimReport {
            segments: vec![0, 1],
            new_doc_count: 5,
            deleted_doc_count: 1,
            target_doc_counts: vec![5],
            mapping: Some(vec![(0, Some(0)), (1, None)]),
        };
        let lines = human_lines(&serde_json::to_value(&report).unwrap(), 0);
        assert!(lines.contains(&"segments: [0, 1]".to_string()));
        assert!(lines.contains(&"new_doc_count: 5".to_string()));
        assert!(lines.contains(&"mapping: [[0, 0], [1, -]]".to_string()));
    }

    #[test]
    fn test_human_lines_nested_objects() {
        let report = PkPlansReport {
            max_doc_count: 4,
            combine_segments: true,
            plans: vec![PrimaryKeyLoadPlan {
                base_doc_id: 0,
                doc_count: 3,
                deleted_doc_count: 0,
                segment_ids: vec![0],
            }],
        };
        let lines = human_lines(&serde_json::to_value(&report).unwrap(), 0);
        assert!(lines.contains(&"plans:".to_string()));
        assert!(lines.contains(&"  #0".to_string()));
        assert!(lines.contains(&"    segment_ids: [0]".to_string()));
    }
}
