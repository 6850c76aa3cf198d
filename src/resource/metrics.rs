//! Build resource metrics reported by writers and modifiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Point-in-time resource usage of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Memory held right now.
    pub current_memory_use: u64,
    /// Scratch memory needed while dumping.
    pub dump_temp_memory_size: u64,
    /// Memory growth of the dumped structure over its in-memory form.
    pub dump_expand_memory_size: u64,
    /// Bytes the dump writes to disk.
    pub dump_file_size: u64,
}

impl ResourceSnapshot {
    fn add(&mut self, other: &ResourceSnapshot) {
        self.current_memory_use += other.current_memory_use;
        self.dump_temp_memory_size += other.dump_temp_memory_size;
        self.dump_expand_memory_size += other.dump_expand_memory_size;
        self.dump_file_size += other.dump_file_size;
    }
}

/// A component that reports its build resource usage.
pub trait ResourceMetricsProvider: Send + Sync {
    fn resource_snapshot(&self) -> ResourceSnapshot;
}

/// Lock-free metrics slot updated by one component.
#[derive(Debug, Default)]
pub struct ResourceMetricsNode {
    current_memory_use: AtomicU64,
    dump_temp_memory_size: AtomicU64,
    dump_expand_memory_size: AtomicU64,
    dump_file_size: AtomicU64,
}

impl ResourceMetricsNode {
    pub fn update(&self, snapshot: ResourceSnapshot) {
        self.current_memory_use
            .store(snapshot.current_memory_use, Ordering::Relaxed);
        self.dump_temp_memory_size
            .store(snapshot.dump_temp_memory_size, Ordering::Relaxed);
        self.dump_expand_memory_size
            .store(snapshot.dump_expand_memory_size, Ordering::Relaxed);
        self.dump_file_size
            .store(snapshot.dump_file_size, Ordering::Relaxed);
    }
}

impl ResourceMetricsProvider for ResourceMetricsNode {
    fn resource_snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            current_memory_use: self.current_memory_use.load(Ordering::Relaxed),
            dump_temp_memory_size: self.dump_temp_memory_size.load(Ordering::Relaxed),
            dump_expand_memory_size: self.dump_expand_memory_size.load(Ordering::Relaxed),
            dump_file_size: self.dump_file_size.load(Ordering::Relaxed),
        }
    }
}

/// Registry of every component's metrics for one build.
#[derive(Default)]
pub struct BuildResourceMetrics {
    providers: Mutex<Vec<Arc<dyn ResourceMetricsProvider>>>,
}

impl std::fmt::Debug for BuildResourceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildResourceMetrics")
            .field("providers", &self.providers.lock().len())
            .finish()
    }
}

impl BuildResourceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component.
    pub fn register(&self, provider: Arc<dyn ResourceMetricsProvider>) {
        self.providers.lock().push(provider);
    }

    /// Allocate and register a fresh node.
    pub fn alloc_node(&self) -> Arc<ResourceMetricsNode> {
        let node = Arc::new(ResourceMetricsNode::default());
        self.register(node.clone());
        node
    }

    pub fn snapshots(&self) -> Vec<ResourceSnapshot> {
        self.providers
            .lock()
            .iter()
            .map(|provider| provider.resource_snapshot())
            .collect()
    }

    /// Sum over every component.
    pub fn total(&self) -> ResourceSnapshot {
        let mut total = ResourceSnapshot::default();
        for snapshot in self.snapshots() {
            total.add(&snapshot);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_aggregate() {
        let metrics = BuildResourceMetrics::new();
        let writer = metrics.alloc_node();
        let modifier = metrics.alloc_node();
        writer.update(ResourceSnapshot {
            current_memory_use: 100,
            dump_temp_memory_size: 10,
            dump_expand_memory_size: 5,
            dump_file_size: 80,
        });
        modifier.update(ResourceSnapshot {
            current_memory_use: 20,
            dump_temp_memory_size: 30,
            dump_expand_memory_size: 0,
            dump_file_size: 8,
        });

        let total = metrics.total();
        assert_eq!(total.current_memory_use, 120);
        assert_eq!(total.dump_temp_memory_size, 40);
        assert_eq!(total.dump_file_size, 88);
        assert_eq!(metrics.snapshots().len(), 2);
    }
}
