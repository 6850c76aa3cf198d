//! Command implementations for the segmerge CLI.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::error::{MergeError, Result};
use crate::merge::{
    MergeConfig, MergeExecutor, MergeSchema, MergeTaskItemCreator, StrategyKind, create_strategy,
};
use crate::primary_key::{CombineSegmentsLoadStrategy, PrimaryKeyLoadStrategy};
use crate::reclaim::{
    BalancedSplitHandler, ReclaimMapCreator, SegmentSplitHandler, UnsortedReclaimMapCreator,
};
use crate::resource::MergeResourceEstimator;
use crate::segment::{SegmentCatalog, SegmentDirectory};
use crate::storage::{FileStorage, Storage};

/// Execute a CLI command.
pub fn execute_command(args: SegmergeArgs) -> Result<()> {
    match &args.command {
        Command::Plan(plan_args) => {
            let report = plan(plan_args)?;
            output_result(
                &format!("{} merge plans", report.plans.len()),
                &report,
                &args,
            )
        }
        Command::Reclaim(reclaim_args) => {
            let report = reclaim(reclaim_args)?;
            output_result("Reclaim map computed", &report, &args)
        }
        Command::PkPlans(pk_args) => {
            let report = pk_plans(pk_args)?;
            output_result(
                &format!("{} primary key load plans", report.plans.len()),
                &report,
                &args,
            )
        }
        Command::Merge(merge_args) => {
            let report = merge(merge_args)?;
            output_result(
                &format!("Committed version {}", report.version_id),
                &report,
                &args,
            )
        }
    }
}

/// Read a segment catalog file into a directory.
pub fn load_directory(path: &Path) -> Result<SegmentDirectory> {
    let json = fs::read_to_string(path)?;
    SegmentDirectory::from_catalog(&SegmentCatalog::from_json(&json)?)
}

fn load_schema(args: &StrategyArgs) -> Result<MergeSchema> {
    match &args.schema {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            serde_json::from_str(&json)
                .map_err(|e| MergeError::configuration(format!("invalid schema: {e}")))
        }
        None => Ok(MergeSchema::default()),
    }
}

/// Merge configuration from the config file with command line overrides.
pub fn merge_config(args: &StrategyArgs) -> Result<MergeConfig> {
    let mut config = match &args.config {
        Some(path) => MergeConfig::load(path)?,
        None => MergeConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.strategy = match strategy {
            StrategyChoice::BalanceTree => StrategyKind::BalanceTree,
            StrategyChoice::Optimize => StrategyKind::Optimize,
            StrategyChoice::SpecificSegments => StrategyKind::SpecificSegments,
        };
    }
    if let Some(params) = &args.params {
        config.strategy_params = params.clone();
    }
    if !args.segments.is_empty() {
        config.specific_segments = args.segments.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Plan a merge without running it.
pub fn plan(args: &PlanArgs) -> Result<PlanReport> {
    let directory = load_directory(&args.catalog)?;
    let config = merge_config(&args.strategy)?;
    let estimator = (!config.resource_quota.is_unlimited()).then(|| {
        MergeResourceEstimator::new(config.resource_quota)
            .with_sort_field_count(config.sort_description.len())
            .with_concurrency(config.effective_threads())
    });
    let strategy = create_strategy(&config, estimator)?;

    let infos = directory.segment_merge_infos();
    let task = if args.strategy.optimize {
        strategy.create_merge_task_for_optimize(&infos, directory.level_info())?
    } else {
        strategy.create_merge_task(&infos, directory.level_info())?
    };

    let items = if args.items {
        let schema = load_schema(&args.strategy)?;
        Some(
            MergeTaskItemCreator::new(schema)
                .with_parallel(config.parallel)
                .create_items(&task),
        )
    } else {
        None
    };

    Ok(PlanReport {
        strategy: strategy.name().to_string(),
        version_id: directory.version().version_id,
        plans: task
            .plans()
            .iter()
            .map(|plan| PlanSummary {
                plan_id: plan.plan_id,
                segments: plan.segment_ids(),
                target_level: plan.target_level,
                target_segment_count: plan.target_segment_count,
                total_docs: plan.total_doc_count(),
                live_docs: plan.live_doc_count(),
            })
            .collect(),
        items,
    })
}

/// Compute the reclaim map of the selected segments.
pub fn reclaim(args: &ReclaimArgs) -> Result<ReclaimReport> {
    let directory = load_directory(&args.catalog)?;
    let infos = if args.segments.is_empty() {
        directory.segment_merge_infos()
    } else {
        directory.merge_infos_for(&args.segments)?
    };
    let live: u64 = infos.iter().map(|s| s.live_doc_count() as u64).sum();

    let mut balanced = if args.targets > 1 {
        Some(BalancedSplitHandler::new(args.targets, live)?)
    } else {
        None
    };
    let split = balanced
        .as_mut()
        .map(|handler| handler as &mut dyn SegmentSplitHandler);
    let map = UnsortedReclaimMapCreator.create(&infos, directory.deletion_map(), split)?;

    Ok(ReclaimReport {
        segments: infos.iter().map(|s| s.segment_id).collect(),
        new_doc_count: map.new_doc_count(),
        deleted_doc_count: map.deleted_doc_count(),
        target_doc_counts: map.target_doc_counts().to_vec(),
        mapping: args.mapping.then(|| map.iter().collect()),
    })
}

/// Group the catalog's segments into primary key load plans.
pub fn pk_plans(args: &PkPlansArgs) -> Result<PkPlansReport> {
    let directory = load_directory(&args.catalog)?;
    let strategy =
        CombineSegmentsLoadStrategy::new(args.max_doc_count)?.with_combine_segments(!args.no_combine);
    let plans = strategy.create_load_plans(directory.segments(), directory.deletion_map())?;
    Ok(PkPlansReport {
        max_doc_count: args.max_doc_count,
        combine_segments: !args.no_combine,
        plans,
    })
}

/// Plan, run and commit a merge against a storage directory.
pub fn merge(args: &MergeArgs) -> Result<MergeReport> {
    let started = Instant::now();
    let directory = load_directory(&args.catalog)?;
    let mut config = merge_config(&args.strategy)?;
    if let Some(threads) = args.threads {
        config.merge_threads = threads;
    }
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&args.storage)?);
    let executor =
        MergeExecutor::new(storage, config)?.with_schema(load_schema(&args.strategy)?);

    let task = if args.strategy.optimize {
        executor.plan_optimize(&directory)?
    } else {
        executor.plan(&directory)?
    };
    let outcome = executor.run(&directory, task)?;

    Ok(MergeReport {
        version_id: outcome.directory.version().version_id,
        merged_segments: outcome.merged_segments,
        plans_executed: outcome.stats.plans_executed,
        items_executed: outcome.stats.items_executed,
        items_skipped: outcome.stats.items_skipped,
        docs_merged: outcome.stats.docs_merged,
        docs_reclaimed: outcome.stats.docs_reclaimed,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;

    const CATALOG: &str = r#"{
        "version_id": 1,
        "level_count": 2,
        "segments": [
            {"segment_id": 0, "doc_count": 3, "deleted_docs": [1]},
            {"segment_id": 1, "doc_count": 2},
            {"segment_id": 2, "doc_count": 2, "is_realtime": true}
        ]
    }"#;

    fn catalog(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("catalog.json");
        fs::write(&path, CATALOG).unwrap();
        path
    }

    fn strategy_args(strategy: StrategyChoice) -> StrategyArgs {
        StrategyArgs {
            config: None,
            strategy: Some(strategy),
            params: None,
            segments: Vec::new(),
            optimize: false,
            schema: None,
        }
    }

    #[test]
    fn test_plan_specific_segments() {
        let dir = TempDir::new().unwrap();
        let mut strategy = strategy_args(StrategyChoice::SpecificSegments);
        strategy.segments = vec![0, 1];
        let report = plan(&PlanArgs {
            catalog: catalog(&dir),
            strategy,
            items: true,
        })
        .unwrap();
        assert_eq!(report.version_id, 1);
        assert_eq!(report.plans.len(), 1);
        assert_eq!(report.plans[0].segments, vec![0, 1]);
        assert_eq!(report.plans[0].live_docs, 4);
        assert_eq!(report.items.unwrap().len(), 1);
    }

    #[test]
    fn test_plan_rejects_bad_params() {
        let dir = TempDir::new().unwrap();
        let mut strategy = strategy_args(StrategyChoice::Optimize);
        strategy.params = Some("nonsense=1".to_string());
        let err = plan(&PlanArgs {
            catalog: catalog(&dir),
            strategy,
            items: false,
        })
        .unwrap_err();
        assert!(matches!(err, MergeError::Configuration(_)));
    }

    #[test]
    fn test_reclaim_report() {
        let dir = TempDir::new().unwrap();
        let report = reclaim(&ReclaimArgs {
            catalog: catalog(&dir),
            segments: vec![0, 1],
            targets: 1,
            mapping: true,
        })
        .unwrap();
        assert_eq!(report.new_doc_count, 4);
        assert_eq!(report.deleted_doc_count, 1);
        assert_eq!(
            report.mapping.unwrap(),
            vec![(0, Some(0)), (1, None), (2, Some(1)), (3, Some(2)), (4, Some(3))]
        );
    }

    #[test]
    fn test_pk_plans_report() {
        let dir = TempDir::new().unwrap();
        let report = pk_plans(&PkPlansArgs {
            catalog: catalog(&dir),
            max_doc_count: 5,
            no_combine: false,
        })
        .unwrap();
        let groups: Vec<_> = report.plans.iter().map(|p| p.segment_ids.clone()).collect();
        assert_eq!(groups, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_merge_into_directory() {
        let dir = TempDir::new().unwrap();
        let mut strategy = strategy_args(StrategyChoice::Optimize);
        strategy.optimize = true;
        let report = merge(&MergeArgs {
            catalog: catalog(&dir),
            storage: dir.path().join("partition"),
            strategy,
            threads: Some(2),
        })
        .unwrap();
        assert_eq!(report.version_id, 2);
        assert_eq!(report.docs_merged, 6);
        assert_eq!(report.docs_reclaimed, 1);
        assert!(dir.path().join("partition").join("version.2").exists());
    }
}
