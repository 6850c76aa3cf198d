//! Execution of merge tasks.
//!
//! The executor prepares a [`MergeTask`] (target segment ids, task items,
//! persisted merge meta), runs every plan on a rayon pool and commits a new
//! Version once every plan has finished. Each finished item leaves a
//! checkpoint, so an interrupted run picks up where it stopped.
//!
//! Plans run concurrently. Within a plan the reclaim map is built once,
//! then the plan's items run concurrently against it. A plan finishes only
//! when all of its items did; the Version commit waits for all plans.
//!
//! With a sub schema and a [`JoinSource`], every plan also gets a
//! sub-document reclaim map derived from the main one, and sub items
//! translate their doc ids through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::attribute::{PatchDedupMerger, PatchKind};
use crate::error::{MergeError, Result};
use crate::merge::checkpoint::CheckpointStore;
use crate::merge::config::MergeConfig;
use crate::merge::item_creator::{MergeMeta, MergeSchema, MergeTaskItemCreator};
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::strategy::create_strategy;
use crate::merge::task_item::{MergeTaskItem, MergeType};
use crate::reclaim::{
    AttributeSource, BalancedSplitHandler, DocCountSplitHandler, JoinSource, ReclaimMap,
    ReclaimMapCreator, SegmentSplitHandler, SortedReclaimMapCreator, UnsortedReclaimMapCreator,
    create_sub_doc_reclaim_map, sub_segments_of,
};
use crate::resource::{
    BuildResourceMetrics, MergeResourceEstimator, calculate_diff_version_lock_size,
    estimate_max_memory_use,
};
use crate::segment::{
    MergedSegment, SegmentDeletionBitmap, SegmentDirectory, SegmentId, SegmentMergeInfo,
};
use crate::storage::Storage;

/// Everything a work item may look at while merging one item.
pub struct MergeContext<'a> {
    pub storage: &'a dyn Storage,
    pub plan: &'a MergePlan,
    pub item: &'a MergeTaskItem,
    pub reclaim_map: &'a ReclaimMap,
    /// Sub-document map of the plan, when the executor has a join source.
    pub sub_reclaim_map: Option<&'a ReclaimMap>,
    /// Sub segments of the plan's inputs, in the sub map's doc id space.
    pub sub_segments: &'a [SegmentMergeInfo],
    pub target_segment_id: SegmentId,
}

/// Reclaim maps of one plan.
struct PlanReclaimMaps {
    main: ReclaimMap,
    sub: Option<(Vec<SegmentMergeInfo>, ReclaimMap)>,
}

/// One unit of merge work, such as merging an inverted index.
pub trait MergeWorkItem: Send + Sync {
    fn execute(&self, ctx: &MergeContext<'_>) -> anyhow::Result<()>;
}

/// Supplies work items for the merge types the executor has no built-in
/// handling for.
pub trait MergeWorkItemFactory: Send + Sync {
    /// `None` leaves the item to the built-in handlers.
    fn create(&self, item: &MergeTaskItem) -> Option<Box<dyn MergeWorkItem>>;
}

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStats {
    pub plans_executed: usize,
    pub items_executed: usize,
    /// Items skipped because their checkpoint already existed.
    pub items_skipped: usize,
    /// Documents written to merged segments.
    pub docs_merged: u64,
    /// Deleted documents dropped by the merge.
    pub docs_reclaimed: u64,
    pub elapsed: Duration,
}

/// Result of a committed merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Directory of the committed Version.
    pub directory: SegmentDirectory,
    pub merged_segments: Vec<MergedSegment>,
    pub stats: MergeStats,
}

#[derive(Default)]
struct RunCounters {
    items_executed: AtomicU64,
    items_skipped: AtomicU64,
}

struct PlanResult {
    merged: Vec<MergedSegment>,
    docs_merged: u64,
    docs_reclaimed: u64,
}

/// Runs merge tasks against one storage.
pub struct MergeExecutor {
    storage: Arc<dyn Storage>,
    config: MergeConfig,
    pool: ThreadPool,
    schema: MergeSchema,
    factory: Option<Box<dyn MergeWorkItemFactory>>,
    attribute_source: Option<Arc<dyn AttributeSource>>,
    join_source: Option<Arc<dyn JoinSource>>,
    /// Memory held by the build the merge runs next to.
    base_memory_bytes: u64,
    checkpoints: CheckpointStore,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for MergeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeExecutor")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .field("schema", &self.schema)
            .field("has_factory", &self.factory.is_some())
            .field("has_join_source", &self.join_source.is_some())
            .field("base_memory_bytes", &self.base_memory_bytes)
            .finish()
    }
}

impl MergeExecutor {
    pub fn new(storage: Arc<dyn Storage>, config: MergeConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.effective_threads())
            .thread_name(|i| format!("segmerge-worker-{i}"))
            .build()
            .map_err(|e| MergeError::internal(format!("Failed to create thread pool: {e}")))?;

        Ok(MergeExecutor {
            checkpoints: CheckpointStore::new(Arc::clone(&storage)),
            storage,
            config,
            pool,
            schema: MergeSchema::default(),
            factory: None,
            attribute_source: None,
            join_source: None,
            base_memory_bytes: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_schema(mut self, schema: MergeSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_work_item_factory(mut self, factory: Box<dyn MergeWorkItemFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Attribute values used to evaluate the sort key of sorted merges.
    pub fn with_attribute_source(mut self, source: Arc<dyn AttributeSource>) -> Self {
        self.attribute_source = Some(source);
        self
    }

    /// Main-to-sub join used to remap sub documents.
    pub fn with_join_source(mut self, join: Arc<dyn JoinSource>) -> Self {
        self.join_source = Some(join);
        self
    }

    /// Charge the memory of a running build against the resource quota,
    /// with `dump_thread_count` of its dumps in flight at once.
    pub fn with_resource_metrics(mut self, metrics: &BuildResourceMetrics, dump_thread_count: usize) -> Self {
        self.base_memory_bytes = estimate_max_memory_use(&metrics.snapshots(), dump_thread_count);
        log::debug!(
            "build holds up to {} bytes with {dump_thread_count} dump threads",
            self.base_memory_bytes
        );
        self
    }

    /// Flag that stops the run before the next item starts.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    fn estimator(&self) -> Option<MergeResourceEstimator> {
        if self.config.resource_quota.is_unlimited() {
            None
        } else {
            Some(
                MergeResourceEstimator::new(self.config.resource_quota)
                    .with_sort_field_count(self.config.sort_description.len())
                    .with_base_memory(self.base_memory_bytes)
                    .with_concurrency(self.pool.current_num_threads()),
            )
        }
    }

    /// Plan a regular merge with the configured strategy.
    pub fn plan(&self, directory: &SegmentDirectory) -> Result<MergeTask> {
        let strategy = create_strategy(&self.config, self.estimator())?;
        let task = strategy.create_merge_task(&directory.segment_merge_infos(), directory.level_info())?;
        log::info!(
            "{} strategy planned {} merge plans over version {}",
            strategy.name(),
            task.len(),
            directory.version().version_id
        );
        Ok(task)
    }

    /// Plan a full compaction with the configured strategy.
    pub fn plan_optimize(&self, directory: &SegmentDirectory) -> Result<MergeTask> {
        let strategy = create_strategy(&self.config, self.estimator())?;
        let task = strategy
            .create_merge_task_for_optimize(&directory.segment_merge_infos(), directory.level_info())?;
        log::info!(
            "{} strategy planned {} optimize plans over version {}",
            strategy.name(),
            task.len(),
            directory.version().version_id
        );
        Ok(task)
    }

    /// Assign target segment ids, create the task items and persist the
    /// merge meta.
    pub fn prepare(&self, directory: &SegmentDirectory, mut task: MergeTask) -> Result<MergeMeta> {
        let mut next_id = directory.next_segment_id();
        for plan in task.plans_mut() {
            let count = plan.target_segment_count.max(1) as SegmentId;
            plan.target_segment_ids = (next_id..next_id + count).collect();
            next_id += count;
        }

        let items = MergeTaskItemCreator::new(self.schema.clone())
            .with_parallel(self.config.parallel)
            .with_resource_count(self.pool.current_num_threads() as u32)
            .create_items(&task);
        let meta = MergeMeta::new(directory.version().version_id, task, items);
        meta.store(self.storage.as_ref())?;
        log::info!(
            "prepared merge of {} plans into {} items (cost {:.1})",
            meta.task.len(),
            meta.items.len(),
            meta.total_cost()
        );
        Ok(meta)
    }

    /// Plan with the configured strategy and run the result.
    pub fn merge(&self, directory: &SegmentDirectory) -> Result<MergeOutcome> {
        let task = self.plan(directory)?;
        self.run(directory, task)
    }

    /// Execute `task` over `directory` and commit the next Version.
    ///
    /// When a merge meta of the same Version exists, the persisted task is
    /// resumed instead and `task` is ignored. On failure nothing is
    /// committed and the merge meta stays behind for the next attempt.
    pub fn run(&self, directory: &SegmentDirectory, task: MergeTask) -> Result<MergeOutcome> {
        let started = Instant::now();
        let meta = self.resume_or_prepare(directory, task)?;
        if meta.task.is_empty() {
            log::info!("nothing to merge in version {}", directory.version().version_id);
            self.cleanup(&meta)?;
            return Ok(MergeOutcome {
                directory: directory.clone(),
                merged_segments: Vec::new(),
                stats: MergeStats {
                    elapsed: started.elapsed(),
                    ..MergeStats::default()
                },
            });
        }

        if let Some(estimator) = self.estimator() {
            estimator.check_plans(meta.task.plans())?;
        }

        let counters = RunCounters::default();
        let results: Vec<Result<PlanResult>> = self.pool.install(|| {
            meta.task
                .plans()
                .par_iter()
                .map(|plan| self.execute_plan(directory, &meta, plan, &counters))
                .collect()
        });

        let mut plan_results = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(result) => plan_results.push(result),
                Err(e) => errors.push(e),
            }
        }
        if let Some(error) = first_error(errors) {
            log::error!("merge of version {} failed: {error}", directory.version().version_id);
            return Err(error);
        }

        let retired: Vec<SegmentId> = meta
            .task
            .plans()
            .iter()
            .flat_map(|plan| plan.segment_ids())
            .collect();
        let merged: Vec<MergedSegment> = plan_results
            .iter()
            .flat_map(|result| result.merged.iter().cloned())
            .collect();
        let next = directory.commit_merge(&retired, &merged)?;
        next.version().store(self.storage.as_ref())?;
        log::info!(
            "committed version {}: {} segments retired, {} merged segments added, {} bytes to lock",
            next.version().version_id,
            retired.len(),
            merged.len(),
            calculate_diff_version_lock_size(directory, &next)
        );
        self.cleanup(&meta)?;

        Ok(MergeOutcome {
            directory: next,
            merged_segments: merged,
            stats: MergeStats {
                plans_executed: plan_results.len(),
                items_executed: counters.items_executed.load(Ordering::Relaxed) as usize,
                items_skipped: counters.items_skipped.load(Ordering::Relaxed) as usize,
                docs_merged: plan_results.iter().map(|r| r.docs_merged).sum(),
                docs_reclaimed: plan_results.iter().map(|r| r.docs_reclaimed).sum(),
                elapsed: started.elapsed(),
            },
        })
    }

    fn resume_or_prepare(&self, directory: &SegmentDirectory, task: MergeTask) -> Result<MergeMeta> {
        let storage = self.storage.as_ref();
        if MergeMeta::exists(storage) {
            let meta = MergeMeta::load(storage)?;
            if meta.version_id == directory.version().version_id {
                log::info!(
                    "resuming merge of version {}: {} of {} items already done",
                    meta.version_id,
                    self.checkpoints.completed_count(&meta.items),
                    meta.items.len()
                );
                return Ok(meta);
            }
            log::warn!(
                "discarding merge meta of version {}, current version is {}",
                meta.version_id,
                directory.version().version_id
            );
            self.cleanup(&meta)?;
        }
        self.prepare(directory, task)
    }

    fn execute_plan(
        &self,
        directory: &SegmentDirectory,
        meta: &MergeMeta,
        plan: &MergePlan,
        counters: &RunCounters,
    ) -> Result<PlanResult> {
        let maps = self.reclaim_maps(directory, plan)?;
        let reclaim_map = &maps.main;
        let items: Vec<&MergeTaskItem> = meta.items_for_plan(plan.plan_id).collect();

        let results: Vec<Result<()>> = items
            .par_iter()
            .map(|item| self.execute_item(plan, item, &maps, counters))
            .collect();
        let errors: Vec<MergeError> = results.into_iter().filter_map(|r| r.err()).collect();
        if let Some(error) = first_error(errors) {
            return Err(error);
        }

        let live = reclaim_map.new_doc_count() as u64;
        let mut merged = Vec::with_capacity(plan.target_segment_count);
        for (idx, &doc_count) in reclaim_map.target_doc_counts().iter().enumerate() {
            if doc_count == 0 {
                continue;
            }
            let segment_id = plan.target_segment_id(idx).ok_or_else(|| {
                MergeError::logic(format!("plan {} has no segment id for target {idx}", plan.plan_id))
            })?;
            let size_bytes = if live == 0 {
                0
            } else {
                (plan.total_segment_size() as u128 * doc_count as u128 / live as u128) as u64
            };
            merged.push(MergedSegment {
                segment_id,
                doc_count,
                level: plan.target_level,
                size_bytes,
            });
        }
        log::info!(
            "plan {} merged segments {:?} into {:?}",
            plan.plan_id,
            plan.segment_ids(),
            merged.iter().map(|m| m.segment_id).collect::<Vec<_>>()
        );
        Ok(PlanResult {
            merged,
            docs_merged: live,
            docs_reclaimed: reclaim_map.deleted_doc_count() as u64,
        })
    }

    fn reclaim_maps(&self, directory: &SegmentDirectory, plan: &MergePlan) -> Result<PlanReclaimMaps> {
        let main = self.reclaim_map(directory, plan)?;
        let sub = match (&self.join_source, &self.schema.sub_schema) {
            (Some(join), Some(_)) => Some(self.sub_reclaim_map(join.as_ref(), plan, &main)?),
            _ => None,
        };
        Ok(PlanReclaimMaps { main, sub })
    }

    /// Load the plan's persisted sub-document map, or derive and persist it.
    fn sub_reclaim_map(
        &self,
        join: &dyn JoinSource,
        plan: &MergePlan,
        main: &ReclaimMap,
    ) -> Result<(Vec<SegmentMergeInfo>, ReclaimMap)> {
        let storage = self.storage.as_ref();
        let (sub_segments, sub_deletions) = sub_segments_of(&plan.segments, join)?;
        let name = ReclaimMap::sub_file_name(plan.plan_id);
        if storage.file_exists(&name) {
            log::debug!("reusing sub reclaim map {name}");
            return Ok((sub_segments, ReclaimMap::load(storage, &name)?));
        }
        let map = create_sub_doc_reclaim_map(main, join, &sub_segments, &sub_deletions)?;
        map.store(storage, &name)?;
        log::debug!(
            "plan {} keeps {} of {} sub documents",
            plan.plan_id,
            map.new_doc_count(),
            map.old_doc_count()
        );
        Ok((sub_segments, map))
    }

    /// Load the plan's persisted reclaim map, or build and persist it.
    fn reclaim_map(&self, directory: &SegmentDirectory, plan: &MergePlan) -> Result<ReclaimMap> {
        let storage = self.storage.as_ref();
        let name = ReclaimMap::file_name(plan.plan_id);
        if storage.file_exists(&name) {
            log::debug!("reusing reclaim map {name}");
            return ReclaimMap::load(storage, &name);
        }

        let creator: Box<dyn ReclaimMapCreator> = if self.config.sort_description.is_empty() {
            Box::new(UnsortedReclaimMapCreator)
        } else {
            let source = self.attribute_source.clone().ok_or_else(|| {
                MergeError::configuration("sorted merge needs an attribute source")
            })?;
            Box::new(SortedReclaimMapCreator::new(
                source,
                self.config.sort_description.clone(),
            )?)
        };

        let mut split = self.split_handler(plan)?;
        let split = split
            .as_mut()
            .map(|handler| handler.as_mut() as &mut dyn SegmentSplitHandler);
        let map = creator.create(&plan.segments, directory.deletion_map(), split)?;
        map.store(storage, &name)?;
        Ok(map)
    }

    /// Targets fill up to `after_merge_max_doc_count` when that limit
    /// alone sets the target count; otherwise documents spread evenly.
    fn split_handler(&self, plan: &MergePlan) -> Result<Option<Box<dyn SegmentSplitHandler>>> {
        let targets = plan.target_segment_count.max(1);
        if targets == 1 {
            return Ok(None);
        }
        let live = plan.live_doc_count();
        let max_doc_count = self.config.strategy_parameter()?.after_merge_max_doc_count as u64;
        if max_doc_count < u32::MAX as u64 && max_doc_count * targets as u64 >= live {
            log::debug!("plan {} fills {targets} targets up to {max_doc_count} docs", plan.plan_id);
            return Ok(Some(Box::new(DocCountSplitHandler::new(max_doc_count, targets)?)));
        }
        Ok(Some(Box::new(BalancedSplitHandler::new(targets, live)?)))
    }

    fn execute_item(
        &self,
        plan: &MergePlan,
        item: &MergeTaskItem,
        maps: &PlanReclaimMaps,
        counters: &RunCounters,
    ) -> Result<()> {
        if self.checkpoints.exists(item) {
            log::warn!("skipping {item}: checkpoint exists");
            counters.items_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(MergeError::cancelled(format!("merge cancelled before {item}")));
        }

        let target_segment_id = plan.target_segment_id(item.target_segment_idx).ok_or_else(|| {
            MergeError::logic(format!(
                "{item} addresses target {} of {}",
                item.target_segment_idx, plan.target_segment_count
            ))
        })?;
        let (sub_segments, sub_reclaim_map) = match &maps.sub {
            Some((segments, map)) => (segments.as_slice(), Some(map)),
            None => (&[][..], None),
        };
        let ctx = MergeContext {
            storage: self.storage.as_ref(),
            plan,
            item,
            reclaim_map: &maps.main,
            sub_reclaim_map,
            sub_segments,
            target_segment_id,
        };

        let started = Instant::now();
        if let Err(e) = self.dispatch(&ctx) {
            log::error!("{item} failed: {e}");
            return Err(e);
        }
        self.checkpoints.mark_done(item)?;
        counters.items_executed.fetch_add(1, Ordering::Relaxed);
        log::debug!("{item} done in {:?}", started.elapsed());
        Ok(())
    }

    fn dispatch(&self, ctx: &MergeContext<'_>) -> Result<()> {
        if let Some(work) = self.factory.as_ref().and_then(|f| f.create(ctx.item)) {
            return Ok(work.execute(ctx)?);
        }
        let (reclaim_map, segments) = if ctx.item.is_sub_item {
            let map = ctx.sub_reclaim_map.ok_or_else(|| {
                MergeError::configuration(format!(
                    "sub-document item {} needs a join source",
                    ctx.item
                ))
            })?;
            (map, ctx.sub_segments)
        } else {
            (ctx.reclaim_map, ctx.plan.segments.as_slice())
        };
        match ctx.item.merge_type {
            MergeType::DeletionMap => {
                let doc_count = reclaim_map
                    .target_doc_counts()
                    .get(ctx.item.target_segment_idx)
                    .copied()
                    .unwrap_or(0);
                let bitmap = SegmentDeletionBitmap::new(ctx.target_segment_id, doc_count);
                if ctx.item.is_sub_item {
                    bitmap.store_sub(ctx.storage)
                } else {
                    bitmap.store(ctx.storage)
                }
            }
            MergeType::Attribute | MergeType::Pack => {
                let kind = if ctx.item.merge_type == MergeType::Attribute {
                    PatchKind::Attribute
                } else {
                    PatchKind::Pack
                };
                let mut merger = PatchDedupMerger::new(kind, &ctx.item.name);
                if ctx.item.is_sub_item {
                    merger = merger.for_sub_segment();
                }
                merger.merge_target(
                    ctx.storage,
                    segments,
                    reclaim_map,
                    ctx.item.target_segment_idx,
                    ctx.target_segment_id,
                )?;
                Ok(())
            }
            other => Err(MergeError::configuration(format!(
                "no work item registered for merge type {other}"
            ))),
        }
    }

    /// Remove checkpoints, the merge meta and, unless kept, reclaim maps.
    fn cleanup(&self, meta: &MergeMeta) -> Result<()> {
        let storage = self.storage.as_ref();
        let removed = self.checkpoints.clear()?;
        if !self.config.keep_reclaim_map {
            for plan in meta.task.plans() {
                for name in [
                    ReclaimMap::file_name(plan.plan_id),
                    ReclaimMap::sub_file_name(plan.plan_id),
                ] {
                    if storage.file_exists(&name) {
                        storage.delete_file(&name)?;
                    }
                }
            }
        }
        if MergeMeta::exists(storage) {
            storage.delete_file(MergeMeta::FILE_NAME)?;
        }
        log::debug!("removed merge meta and {removed} checkpoints");
        Ok(())
    }
}

/// The first fatal error, else the first error.
fn first_error(mut errors: Vec<MergeError>) -> Option<MergeError> {
    match errors.iter().position(MergeError::is_fatal) {
        Some(idx) => Some(errors.swap_remove(idx)),
        None => errors.into_iter().next(),
    }
}
