//! Explicitly owned cache of opened segment readers.
//!
//! Merges that touch the same input segment from several items share one
//! opened reader through this cache. Whoever owns the executor owns the
//! cache; idle entries are evicted by a [`CleanupTask`] the owner starts and
//! stops, not by a process-wide loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, select, tick};
use parking_lot::Mutex;

use crate::error::{MergeError, Result};
use crate::segment::SegmentId;

#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    last_access: Instant,
}

/// Cache of per-segment readers of type `V`.
#[derive(Debug)]
pub struct SegmentReaderCache<V> {
    entries: Mutex<HashMap<SegmentId, CacheEntry<V>>>,
}

impl<V> Default for SegmentReaderCache<V> {
    fn default() -> Self {
        SegmentReaderCache {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Send + Sync + 'static> SegmentReaderCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached reader or open it with `load`.
    ///
    /// `load` runs outside the lock; if two callers race, the first insert
    /// wins and both get the same reader.
    pub fn get_or_load<F>(&self, segment_id: SegmentId, load: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(entry) = self.entries.lock().get_mut(&segment_id) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.value));
        }

        let loaded = Arc::new(load()?);
        let mut entries = self.entries.lock();
        let entry = entries.entry(segment_id).or_insert_with(|| CacheEntry {
            value: loaded,
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        Ok(Arc::clone(&entry.value))
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.entries.lock().contains_key(&segment_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a reader, e.g. when its segment is retired.
    pub fn invalidate(&self, segment_id: SegmentId) {
        self.entries.lock().remove(&segment_id);
    }

    /// Evict readers not accessed for `max_idle`. Readers still held by a
    /// caller stay alive through their `Arc` until released.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_access) < max_idle);
        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("evicted {evicted} idle segment readers");
        }
        evicted
    }

    /// Start a thread that calls [`Self::evict_idle`] every `interval`.
    pub fn spawn_cleanup_task(
        cache: Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> Result<CleanupTask> {
        let (stop_sender, stop_receiver) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("segment-reader-cache-cleanup".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            cache.evict_idle(max_idle);
                        }
                        recv(stop_receiver) -> _ => break,
                    }
                }
            })
            .map_err(|e| MergeError::internal(format!("failed to spawn cleanup thread: {e}")))?;

        Ok(CleanupTask {
            stop_sender: Some(stop_sender),
            handle: Some(handle),
        })
    }
}

/// Handle of a running cleanup thread. Stops the thread when dropped.
#[derive(Debug)]
pub struct CleanupTask {
    stop_sender: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CleanupTask {
    /// Stop the cleanup thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel, which also wakes the thread.
        if let Some(sender) = self.stop_sender.take() {
            let _ = sender.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
