//! Segment membership cache (server-side mode).
//!
//! Segments are registered by name as split definitions reference them;
//! only registered segments are fetched by the polling scheduler. Per
//! segment, writes carrying an older change number than the stored one
//! are dropped (equal is allowed, segment diffs are idempotent).

use crate::error::StorageResult;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Cache of segment key sets, one change number per segment.
pub trait SegmentsCache: Send + Sync {
    /// Registers segment names for synchronization. Returns `true` when at
    /// least one name was not registered before.
    fn register_segments(&self, names: &[String]) -> StorageResult<bool>;

    fn registered_segments(&self) -> StorageResult<Vec<String>>;

    /// Applies a key diff to one segment. Returns `Ok(false)` without
    /// touching the cache when `change_number` is older than the stored one.
    fn update(
        &self,
        name: &str,
        added: Vec<String>,
        removed: Vec<String>,
        change_number: i64,
    ) -> StorageResult<bool>;

    /// Change number for a segment, `-1` when unknown.
    fn change_number(&self, name: &str) -> i64;

    fn set_change_number(&self, name: &str, change_number: i64) -> StorageResult<()>;

    fn is_in_segment(&self, name: &str, key: &str) -> StorageResult<bool>;
}

struct SegmentData {
    keys: HashSet<String>,
    change_number: i64,
}

impl Default for SegmentData {
    fn default() -> Self {
        Self {
            keys: HashSet::new(),
            change_number: -1,
        }
    }
}

/// In-memory implementation of [`SegmentsCache`]. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemorySegmentsCache {
    inner: Arc<Mutex<HashMap<String, SegmentData>>>,
}

impl InMemorySegmentsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentsCache for InMemorySegmentsCache {
    fn register_segments(&self, names: &[String]) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let mut added = false;
        for name in names {
            if !inner.contains_key(name) {
                inner.insert(name.clone(), SegmentData::default());
                added = true;
            }
        }
        Ok(added)
    }

    fn registered_segments(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().keys().cloned().collect())
    }

    fn update(
        &self,
        name: &str,
        added: Vec<String>,
        removed: Vec<String>,
        change_number: i64,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let segment = inner.entry(name.to_string()).or_default();
        if change_number < segment.change_number {
            return Ok(false);
        }
        for key in removed {
            segment.keys.remove(&key);
        }
        segment.keys.extend(added);
        segment.change_number = change_number;
        Ok(true)
    }

    fn change_number(&self, name: &str) -> i64 {
        self.inner
            .lock()
            .map(|i| i.get(name).map(|s| s.change_number).unwrap_or(-1))
            .unwrap_or(-1)
    }

    fn set_change_number(&self, name: &str, change_number: i64) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(name.to_string()).or_default().change_number = change_number;
        Ok(())
    }

    fn is_in_segment(&self, name: &str, key: &str) -> StorageResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.keys.contains(key))
            .unwrap_or(false))
    }
}
