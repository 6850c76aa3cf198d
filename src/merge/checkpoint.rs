//! Checkpoint files of finished merge task items.

use std::sync::Arc;

use crate::error::Result;
use crate::merge::task_item::{CheckpointName, MergeTaskItem};
use crate::storage::Storage;

/// Directory of checkpoint files.
pub const CHECKPOINT_DIR: &str = "merge_meta/checkpoints";

/// Checkpoint files in a storage.
///
/// A checkpoint holds the JSON of the item it marks; its name alone is what
/// identifies the item.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn Storage>,
}

impl CheckpointStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        CheckpointStore { storage }
    }

    fn path(item: &MergeTaskItem) -> String {
        format!("{CHECKPOINT_DIR}/{}", item.checkpoint_name())
    }

    pub fn exists(&self, item: &MergeTaskItem) -> bool {
        self.storage.file_exists(&Self::path(item))
    }

    /// Record `item` as done.
    pub fn mark_done(&self, item: &MergeTaskItem) -> Result<()> {
        let json = serde_json::to_vec(item)?;
        self.storage.write_atomic(&Self::path(item), &json)
    }

    /// Parsed names of all checkpoints. Unrecognised files are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointName>> {
        let prefix = format!("{CHECKPOINT_DIR}/");
        let mut names = Vec::new();
        for file in self.storage.list_files_with_prefix(&prefix)? {
            let file_name = &file[prefix.len()..];
            match CheckpointName::parse(file_name) {
                Ok(name) => names.push(name),
                Err(_) => log::warn!("ignoring unrecognised checkpoint file {file}"),
            }
        }
        Ok(names)
    }

    /// How many of `items` are already checkpointed.
    pub fn completed_count(&self, items: &[MergeTaskItem]) -> usize {
        items.iter().filter(|item| self.exists(item)).count()
    }

    /// Remove every checkpoint file.
    pub fn clear(&self) -> Result<usize> {
        let files = self
            .storage
            .list_files_with_prefix(&format!("{CHECKPOINT_DIR}/"))?;
        for file in &files {
            self.storage.delete_file(file)?;
        }
        Ok(files.len())
    }
}
