//! Versions, levels and the segment directory.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::segment::deletion::{DeletionMap, DeletionMapReader, SegmentDeletionBitmap};
use crate::segment::info::{SegmentInfo, SegmentMergeInfo};
use crate::segment::{DocId, SegmentId};
use crate::storage::Storage;

/// How segments inside one level are organised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LevelTopology {
    /// Segments ordered by build time, ranges may overlap.
    #[default]
    Sequence,
    /// Segments sharded by key hash.
    Hash,
}

/// One level of the level tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMeta {
    pub level_idx: u32,
    #[serde(default)]
    pub topology: LevelTopology,
    pub segments: Vec<SegmentId>,
}

/// Level layout of a Version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LevelInfo {
    pub levels: Vec<LevelMeta>,
}

impl LevelInfo {
    /// Create `level_count` empty levels; level 0 is sequenced, the rest hashed.
    pub fn new(level_count: u32) -> Self {
        let levels = (0..level_count.max(1))
            .map(|level_idx| LevelMeta {
                level_idx,
                topology: if level_idx == 0 {
                    LevelTopology::Sequence
                } else {
                    LevelTopology::Hash
                },
                segments: Vec::new(),
            })
            .collect();
        LevelInfo { levels }
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Level holding `segment_id`.
    pub fn level_of(&self, segment_id: SegmentId) -> Option<u32> {
        self.levels
            .iter()
            .find(|level| level.segments.contains(&segment_id))
            .map(|level| level.level_idx)
    }

    /// Append a segment to a level, growing the tree when needed.
    pub fn add_segment(&mut self, level_idx: u32, segment_id: SegmentId) {
        while self.level_count() <= level_idx {
            let next = self.level_count();
            self.levels.push(LevelMeta {
                level_idx: next,
                topology: LevelTopology::Hash,
                segments: Vec::new(),
            });
        }
        let level = &mut self.levels[level_idx as usize];
        if !level.segments.contains(&segment_id) {
            level.segments.push(segment_id);
        }
    }

    /// Drop a segment from whichever level holds it.
    pub fn remove_segment(&mut self, segment_id: SegmentId) -> bool {
        let mut removed = false;
        for level in &mut self.levels {
            let before = level.segments.len();
            level.segments.retain(|&id| id != segment_id);
            removed |= level.segments.len() != before;
        }
        removed
    }
}

/// A committed set of live segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: u64,
    pub segments: Vec<SegmentId>,
    pub level_info: LevelInfo,
    /// Commit time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Version {
    pub fn new(version_id: u64, segments: Vec<SegmentId>, level_info: LevelInfo) -> Self {
        Version {
            version_id,
            segments,
            level_info,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn file_name(version_id: u64) -> String {
        format!("version.{version_id}")
    }

    /// Persist as JSON, atomically.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        storage.write_atomic(&Self::file_name(self.version_id), &data)
    }

    pub fn load(storage: &dyn Storage, version_id: u64) -> Result<Self> {
        let data = storage.read_all(&Self::file_name(version_id))?;
        serde_json::from_slice(&data)
            .map_err(|e| MergeError::corrupt(format!("version.{version_id}: {e}")))
    }

    /// Id of the newest persisted Version, if any.
    pub fn latest_id(storage: &dyn Storage) -> Result<Option<u64>> {
        Ok(storage
            .list_files_with_prefix("version.")?
            .iter()
            .filter_map(|name| name.strip_prefix("version.")?.parse::<u64>().ok())
            .max())
    }
}

/// Serialized description of one segment, as found in a catalog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSegment {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    #[serde(default)]
    pub is_realtime: bool,
    #[serde(default)]
    pub size_bytes: u64,
    /// Deleted local doc ids.
    #[serde(default)]
    pub deleted_docs: Vec<u32>,
    #[serde(default)]
    pub level: u32,
}

/// Serialized segment catalog: the merge engine's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SegmentCatalog {
    #[serde(default)]
    pub version_id: u64,
    #[serde(default = "default_level_count")]
    pub level_count: u32,
    pub segments: Vec<CatalogSegment>,
}

fn default_level_count() -> u32 {
    1
}

impl SegmentCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| MergeError::configuration(format!("invalid segment catalog: {e}")))
    }
}

/// Description of a segment produced by a committed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSegment {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    pub level: u32,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Read-only view of one Version: segments, doc id bases and deletions.
#[derive(Debug, Clone)]
pub struct SegmentDirectory {
    version: Version,
    /// Segments in doc id order.
    segments: Vec<SegmentInfo>,
    deletion_map: DeletionMap,
}

impl SegmentDirectory {
    /// Build a directory from a catalog. Offline segments come first, then
    /// realtime ones; each group is ordered by segment id.
    pub fn from_catalog(catalog: &SegmentCatalog) -> Result<Self> {
        let mut entries: Vec<&CatalogSegment> = catalog.segments.iter().collect();
        entries.sort_by_key(|segment| (segment.is_realtime, segment.segment_id));
        let mut seen = BTreeSet::new();
        for entry in &entries {
            if !seen.insert(entry.segment_id) {
                return Err(MergeError::configuration(format!(
                    "duplicate segment id {}",
                    entry.segment_id
                )));
            }
        }

        let mut level_info = LevelInfo::new(catalog.level_count);
        let mut segments = Vec::with_capacity(entries.len());
        let mut deletion_map = DeletionMap::new();
        let mut base: DocId = 0;

        for entry in entries {
            let mut info = SegmentInfo::new(entry.segment_id, entry.doc_count);
            info.base_doc_id = base;
            info.is_realtime = entry.is_realtime;
            info.size_bytes = entry.size_bytes;

            let mut bitmap = SegmentDeletionBitmap::new(entry.segment_id, entry.doc_count);
            for &local in &entry.deleted_docs {
                bitmap.delete(local).map_err(|e| {
                    MergeError::configuration(format!(
                        "segment {}: {e}",
                        entry.segment_id
                    ))
                })?;
            }
            deletion_map.insert_bitmap(base, bitmap);
            level_info.add_segment(entry.level, entry.segment_id);

            base = base.checked_add(entry.doc_count).ok_or_else(|| {
                MergeError::configuration("total doc count overflows the doc id space")
            })?;
            segments.push(info);
        }

        let ids = segments.iter().map(|s| s.segment_id).collect();
        Ok(SegmentDirectory {
            version: Version::new(catalog.version_id, ids, level_info),
            segments,
            deletion_map,
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn level_info(&self) -> &LevelInfo {
        &self.version.level_info
    }

    pub fn deletion_map(&self) -> &DeletionMap {
        &self.deletion_map
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    pub fn segment(&self, segment_id: SegmentId) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    pub fn total_doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count as u64).sum()
    }

    /// Smallest id greater than every existing segment id.
    pub fn next_segment_id(&self) -> SegmentId {
        self.segments
            .iter()
            .map(|s| s.segment_id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Merge input view of every segment, in doc id order.
    pub fn segment_merge_infos(&self) -> Vec<SegmentMergeInfo> {
        self.segments.iter().map(|s| self.merge_info(s)).collect()
    }

    /// Merge input view of the given segments, in doc id order.
    pub fn merge_infos_for(&self, segment_ids: &[SegmentId]) -> Result<Vec<SegmentMergeInfo>> {
        for id in segment_ids {
            if self.segment(*id).is_none() {
                return Err(MergeError::not_found(format!("segment {id}")));
            }
        }
        Ok(self
            .segments
            .iter()
            .filter(|s| segment_ids.contains(&s.segment_id))
            .map(|s| self.merge_info(s))
            .collect())
    }

    fn merge_info(&self, info: &SegmentInfo) -> SegmentMergeInfo {
        let mut merge_info = SegmentMergeInfo::new(
            info.segment_id,
            info.base_doc_id,
            info.doc_count,
            self.deletion_map.deleted_doc_count(info.segment_id),
        );
        merge_info.segment_size = info.size_bytes;
        merge_info
    }

    /// Produce the directory of the next Version: `retired` segments leave,
    /// `merged` segments join with no deletions, bases are recomputed.
    pub fn commit_merge(
        &self,
        retired: &[SegmentId],
        merged: &[MergedSegment],
    ) -> Result<SegmentDirectory> {
        for id in retired {
            if self.segment(*id).is_none() {
                return Err(MergeError::logic(format!("retiring unknown segment {id}")));
            }
        }
        for segment in merged {
            if self.segment(segment.segment_id).is_some() {
                return Err(MergeError::logic(format!(
                    "merged segment id {} is already in use",
                    segment.segment_id
                )));
            }
        }

        let mut level_info = self.version.level_info.clone();
        let mut segments: Vec<SegmentInfo> = Vec::new();

        for info in &self.segments {
            if retired.contains(&info.segment_id) {
                level_info.remove_segment(info.segment_id);
            } else {
                segments.push(info.clone());
            }
        }
        for segment in merged {
            let mut info = SegmentInfo::new(segment.segment_id, segment.doc_count);
            info.merged = true;
            info.size_bytes = segment.size_bytes;
            segments.push(info);
            level_info.add_segment(segment.level, segment.segment_id);
        }
        segments.sort_by_key(|s| (s.is_realtime, s.segment_id));

        let mut deletion_map = DeletionMap::new();
        let mut base: DocId = 0;
        for info in &mut segments {
            info.base_doc_id = base;
            let bitmap = self
                .deletion_map
                .bitmap(info.segment_id)
                .cloned()
                .unwrap_or_else(|| SegmentDeletionBitmap::new(info.segment_id, info.doc_count));
            deletion_map.insert_bitmap(base, bitmap);
            base += info.doc_count;
        }

        let ids = segments.iter().map(|s| s.segment_id).collect();
        Ok(SegmentDirectory {
            version: Version::new(self.version.version_id + 1, ids, level_info),
            segments,
            deletion_map,
        })
    }
}
