//! Command line argument parsing for the segmerge CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::segment::SegmentId;

/// segmerge - plan and run segment merges over a segment catalog
#[derive(Parser, Debug, Clone)]
#[command(name = "segmerge")]
#[command(about = "Plan and run segment merges over a segment catalog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct SegmergeArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl SegmergeArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the merge plans a strategy produces for a catalog
    Plan(PlanArgs),

    /// Compute the reclaim map of a set of segments
    Reclaim(ReclaimArgs),

    /// Show how segments group into primary key load plans
    #[command(name = "pk-plans")]
    PkPlans(PkPlansArgs),

    /// Plan, run and commit a merge into a storage directory
    Merge(MergeArgs),
}

/// Strategy selection shared by `plan` and `merge`.
#[derive(clap::Args, Debug, Clone)]
pub struct StrategyArgs {
    /// Merge configuration file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Strategy, overriding the configuration
    #[arg(short, long)]
    pub strategy: Option<StrategyChoice>,

    /// Strategy parameters as key=value;key=value
    #[arg(short, long)]
    pub params: Option<String>,

    /// Segment ids for the specific-segments strategy (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub segments: Vec<SegmentId>,

    /// Plan a full compaction instead of a regular merge
    #[arg(long)]
    pub optimize: bool,

    /// Index schema file (JSON) listing what each plan merges
    #[arg(long, value_name = "SCHEMA_FILE")]
    pub schema: Option<PathBuf>,
}

/// Arguments for planning
#[derive(Parser, Debug, Clone)]
pub struct PlanArgs {
    /// Segment catalog file (JSON)
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    #[command(flatten)]
    pub strategy: StrategyArgs,

    /// Also list the task items of every plan
    #[arg(long)]
    pub items: bool,
}

/// Arguments for reclaim map computation
#[derive(Parser, Debug, Clone)]
pub struct ReclaimArgs {
    /// Segment catalog file (JSON)
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    /// Input segments (comma-separated); all segments when omitted
    #[arg(long, value_delimiter = ',')]
    pub segments: Vec<SegmentId>,

    /// Number of output segments
    #[arg(short, long, default_value = "1")]
    pub targets: usize,

    /// Print the old to new doc id mapping
    #[arg(long)]
    pub mapping: bool,
}

/// Arguments for primary key load planning
#[derive(Parser, Debug, Clone)]
pub struct PkPlansArgs {
    /// Segment catalog file (JSON)
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    /// Maximum docs per combined load plan
    #[arg(short, long, default_value_t = u32::MAX as u64)]
    pub max_doc_count: u64,

    /// Give every segment its own load plan
    #[arg(long)]
    pub no_combine: bool,
}

/// Arguments for running a merge
#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    /// Segment catalog file (JSON)
    #[arg(value_name = "CATALOG")]
    pub catalog: PathBuf,

    /// Directory holding segment data and merge state
    #[arg(long, value_name = "DIR")]
    pub storage: PathBuf,

    #[command(flatten)]
    pub strategy: StrategyArgs,

    /// Worker threads (default: one per CPU)
    #[arg(short = 'j', long)]
    pub threads: Option<usize>,
}

/// Merge strategies selectable on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyChoice {
    /// Tiered merging by layer
    BalanceTree,
    /// Full compaction
    Optimize,
    /// Merge the segments given with --segments
    SpecificSegments,
}

/// Output formats available in CLI
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable format
    Human,
    /// JSON format
    Json,
}
