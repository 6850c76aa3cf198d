//! Expansion of merge plans into task items, and the persisted merge meta.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::merge::plan::{MergePlan, MergeTask};
use crate::merge::task_item::{MergeTaskItem, MergeType, ParallelMergeItem};
use crate::storage::Storage;

/// Merge-relevant shape of an index schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSchema {
    pub indexes: Vec<String>,
    pub attributes: Vec<String>,
    pub packs: Vec<String>,
    pub primary_key: Option<String>,
    pub has_summary: bool,
    /// Schema of joined sub-documents.
    pub sub_schema: Option<Box<MergeSchema>>,
}

impl MergeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut self, name: impl Into<String>) -> Self {
        self.indexes.push(name.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    pub fn with_pack(mut self, name: impl Into<String>) -> Self {
        self.packs.push(name.into());
        self
    }

    pub fn with_primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    pub fn with_summary(mut self) -> Self {
        self.has_summary = true;
        self
    }

    pub fn with_sub_schema(mut self, sub: MergeSchema) -> Self {
        self.sub_schema = Some(Box::new(sub));
        self
    }

    /// `(type, name)` of every unit of merge work the schema implies, in
    /// execution order.
    fn work_units(&self) -> Vec<(MergeType, String)> {
        let mut units = vec![(MergeType::DeletionMap, MergeType::DeletionMap.to_string())];
        if let Some(pk) = &self.primary_key {
            units.push((MergeType::PrimaryKey, pk.clone()));
        }
        if self.has_summary {
            units.push((MergeType::Summary, MergeType::Summary.to_string()));
        }
        units.extend(self.indexes.iter().map(|n| (MergeType::Index, n.clone())));
        units.extend(self.attributes.iter().map(|n| (MergeType::Attribute, n.clone())));
        units.extend(self.packs.iter().map(|n| (MergeType::Pack, n.clone())));
        units
    }
}

/// Creates the task items of a merge task.
#[derive(Debug, Clone)]
pub struct MergeTaskItemCreator {
    schema: MergeSchema,
    parallel: u32,
    resource_count: u32,
}

impl MergeTaskItemCreator {
    pub fn new(schema: MergeSchema) -> Self {
        MergeTaskItemCreator {
            schema,
            parallel: 1,
            resource_count: 0,
        }
    }

    /// Shard count of parallel-capable items.
    pub fn with_parallel(mut self, parallel: u32) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    /// Number of worker resources shards are spread over.
    pub fn with_resource_count(mut self, resource_count: u32) -> Self {
        self.resource_count = resource_count;
        self
    }

    pub fn create_items(&self, task: &MergeTask) -> Vec<MergeTaskItem> {
        let mut items = Vec::new();
        let mut next_resource = 0u32;
        for plan in task.plans() {
            self.create_plan_items(plan, &self.schema, false, &mut next_resource, &mut items);
            if let Some(sub) = &self.schema.sub_schema {
                self.create_plan_items(plan, sub, true, &mut next_resource, &mut items);
            }
        }
        log::debug!(
            "created {} merge task items for {} plans",
            items.len(),
            task.len()
        );
        items
    }

    fn create_plan_items(
        &self,
        plan: &MergePlan,
        schema: &MergeSchema,
        is_sub_item: bool,
        next_resource: &mut u32,
        items: &mut Vec<MergeTaskItem>,
    ) {
        let targets = plan.target_segment_count.max(1);
        let docs_per_target = plan.live_doc_count() as f64 / targets as f64;

        for target in 0..targets {
            for (merge_type, name) in schema.work_units() {
                if is_sub_item && merge_type == MergeType::PrimaryKey {
                    continue;
                }
                let shards = if merge_type.supports_parallel() {
                    self.parallel
                } else {
                    1
                };
                for shard in 0..shards {
                    let mut parallel = ParallelMergeItem::new(shard, shards);
                    if self.resource_count > 0 {
                        parallel.resource_ids.push(*next_resource % self.resource_count);
                        *next_resource += 1;
                    }
                    let cost = docs_per_target * merge_type.cost_weight() * parallel.data_ratio;
                    items.push(
                        MergeTaskItem::new(plan.plan_id, merge_type, name.clone())
                            .with_target(target)
                            .with_sub_item(is_sub_item)
                            .with_parallel(parallel)
                            .with_cost(cost),
                    );
                }
            }
        }
    }
}

/// Persisted description of a running merge, reloaded on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMeta {
    /// Version the task was planned against.
    #[serde(default)]
    pub version_id: u64,
    pub task: MergeTask,
    pub items: Vec<MergeTaskItem>,
    pub created_at: DateTime<Utc>,
}

impl MergeMeta {
    pub const DIRECTORY: &'static str = "merge_meta";
    pub const FILE_NAME: &'static str = "merge_meta/task.json";

    pub fn new(version_id: u64, task: MergeTask, items: Vec<MergeTaskItem>) -> Self {
        MergeMeta {
            version_id,
            task,
            items,
            created_at: Utc::now(),
        }
    }

    pub fn exists(storage: &dyn Storage) -> bool {
        storage.file_exists(Self::FILE_NAME)
    }

    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        storage.write_atomic(Self::FILE_NAME, &json)
    }

    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let data = storage.read_all(Self::FILE_NAME)?;
        serde_json::from_slice(&data)
            .map_err(|e| MergeError::corrupt(format!("{}: {e}", Self::FILE_NAME)))
    }

    pub fn items_for_plan(&self, plan_id: usize) -> impl Iterator<Item = &MergeTaskItem> {
        self.items.iter().filter(move |i| i.merge_plan_id == plan_id)
    }

    /// Sum of item costs.
    pub fn total_cost(&self) -> f64 {
        self.items.iter().map(|i| i.cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentMergeInfo;
    use crate::storage::MemoryStorage;

    fn task() -> MergeTask {
        [MergePlan::new(vec![
            SegmentMergeInfo::new(0, 0, 100, 0),
            SegmentMergeInfo::new(1, 100, 100, 0),
        ])]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_items_per_merge_type() {
        let schema = MergeSchema::new()
            .with_primary_key("id")
            .with_summary()
            .with_index("title")
            .with_attribute("price")
            .with_pack("pack0");
        let items = MergeTaskItemCreator::new(schema).create_items(&task());
        let kinds: Vec<_> = items
            .iter()
            .map(|i| (i.merge_type, i.name.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (MergeType::DeletionMap, "deletionmap"),
                (MergeType::PrimaryKey, "id"),
                (MergeType::Summary, "summary"),
                (MergeType::Index, "title"),
                (MergeType::Attribute, "price"),
                (MergeType::Pack, "pack0"),
            ]
        );
        let index = &items[3];
        assert!((index.cost - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_shards_and_resources() {
        let schema = MergeSchema::new().with_index("body").with_attribute("price");
        let items = MergeTaskItemCreator::new(schema)
            .with_parallel(3)
            .with_resource_count(2)
            .create_items(&task());
        let shards: Vec<_> = items
            .iter()
            .filter(|i| i.merge_type == MergeType::Index)
            .collect();
        assert_eq!(shards.len(), 3);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.parallel_merge_item.id, i as u32);
            assert_eq!(shard.parallel_merge_item.total_count, 3);
            assert!((shard.parallel_merge_item.data_ratio - 1.0 / 3.0).abs() < 1e-9);
        }
        let resources: Vec<_> = items
            .iter()
            .map(|i| i.parallel_merge_item.resource_ids[0])
            .collect();
        assert_eq!(resources, vec![0, 1, 0, 1, 0]);

        let attribute = items
            .iter()
            .find(|i| i.merge_type == MergeType::Attribute)
            .unwrap();
        assert!(!attribute.parallel_merge_item.is_sharded());

        let names: std::collections::HashSet<_> =
            items.iter().map(|i| i.checkpoint_name()).collect();
        assert_eq!(names.len(), items.len());
    }

    #[test]
    fn test_items_per_target_and_sub_schema() {
        let mut task = task();
        task.plans_mut()[0].target_segment_count = 2;
        let schema = MergeSchema::new()
            .with_primary_key("id")
            .with_sub_schema(MergeSchema::new().with_primary_key("sub_id").with_attribute("sku"));
        let items = MergeTaskItemCreator::new(schema).create_items(&task);

        let main: Vec<_> = items.iter().filter(|i| !i.is_sub_item).collect();
        let sub: Vec<_> = items.iter().filter(|i| i.is_sub_item).collect();
        assert_eq!(main.len(), 4);
        assert_eq!(sub.len(), 4);
        assert!(sub.iter().all(|i| i.merge_type != MergeType::PrimaryKey));
        assert_eq!(
            main.iter().map(|i| i.target_segment_idx).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );
    }

    #[test]
    fn test_merge_meta_round_trip() {
        let storage = MemoryStorage::new();
        assert!(!MergeMeta::exists(&storage));
        let task = task();
        let items = MergeTaskItemCreator::new(MergeSchema::new()).create_items(&task);
        let meta = MergeMeta::new(3, task, items);
        meta.store(&storage).unwrap();
        assert!(MergeMeta::exists(&storage));
        let loaded = MergeMeta::load(&storage).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.version_id, 3);
        assert_eq!(loaded.items_for_plan(0).count(), 1);
    }

    #[test]
    fn test_merge_meta_corrupt() {
        let storage = MemoryStorage::new();
        storage.replace_bytes(MergeMeta::FILE_NAME, b"{not json".to_vec());
        assert!(matches!(
            MergeMeta::load(&storage),
            Err(MergeError::CorruptData(_))
        ));
    }
}
