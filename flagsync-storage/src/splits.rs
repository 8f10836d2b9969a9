//! Split definitions cache.
//!
//! Writes are guarded by the collection change number: an update whose
//! change number is not strictly greater than the stored one is a no-op.
//! Both transports (polling and push reconciliation) write through this
//! guard, which is the only thing that keeps their interleavings safe.

use crate::error::StorageResult;
use crate::model::Split;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cache of split definitions, versioned by a collection change number.
pub trait SplitsCache: Send + Sync {
    /// Applies a batch of added/updated and archived splits.
    ///
    /// Returns `Ok(false)` without touching the cache when `change_number`
    /// is not strictly greater than the stored one.
    fn update(
        &self,
        to_add: Vec<Split>,
        to_remove: Vec<Split>,
        change_number: i64,
    ) -> StorageResult<bool>;

    /// Current collection change number, `-1` when nothing has been stored
    /// or the backend is unavailable.
    fn change_number(&self) -> i64;

    fn set_change_number(&self, change_number: i64) -> StorageResult<()>;

    fn get(&self, name: &str) -> StorageResult<Option<Split>>;

    fn get_all(&self) -> StorageResult<Vec<Split>>;

    fn split_names(&self) -> StorageResult<Vec<String>>;

    /// Marks a split as killed with the given default treatment, if `change_number`
    /// is newer than the split's own. Returns whether the write was applied.
    fn kill_locally(
        &self,
        name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> StorageResult<bool>;

    /// Whether any active split uses the given traffic type.
    ///
    /// Never fails: on any internal fault this answers `true` so event
    /// tracking is not blocked by a broken cache.
    fn traffic_type_exists(&self, traffic_type: &str) -> bool;

    /// Whether any stored split references a segment.
    fn uses_segments(&self) -> bool;
}

struct SplitsInner {
    splits: HashMap<String, Split>,
    change_number: i64,
    traffic_types: HashMap<String, usize>,
    segment_users: usize,
}

impl Default for SplitsInner {
    fn default() -> Self {
        Self {
            splits: HashMap::new(),
            change_number: -1,
            traffic_types: HashMap::new(),
            segment_users: 0,
        }
    }
}

impl SplitsInner {
    fn insert(&mut self, split: Split) {
        if !split.traffic_type_name.is_empty() {
            *self
                .traffic_types
                .entry(split.traffic_type_name.clone())
                .or_insert(0) += 1;
        }
        if split.uses_segments() {
            self.segment_users += 1;
        }
        if let Some(old) = self.splits.insert(split.name.clone(), split) {
            self.forget_counts(&old);
        }
    }

    fn remove(&mut self, name: &str) {
        if let Some(old) = self.splits.remove(name) {
            self.forget_counts(&old);
        }
    }

    fn forget_counts(&mut self, split: &Split) {
        if !split.traffic_type_name.is_empty() {
            if let Some(count) = self.traffic_types.get_mut(&split.traffic_type_name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.traffic_types.remove(&split.traffic_type_name);
                }
            }
        }
        if split.uses_segments() {
            self.segment_users = self.segment_users.saturating_sub(1);
        }
    }
}

/// In-memory implementation of [`SplitsCache`]. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemorySplitsCache {
    inner: Arc<Mutex<SplitsInner>>,
}

impl InMemorySplitsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SplitsCache for InMemorySplitsCache {
    fn update(
        &self,
        to_add: Vec<Split>,
        to_remove: Vec<Split>,
        change_number: i64,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if change_number <= inner.change_number {
            return Ok(false);
        }
        for split in to_remove {
            inner.remove(&split.name);
        }
        for split in to_add {
            inner.insert(split);
        }
        inner.change_number = change_number;
        Ok(true)
    }

    fn change_number(&self) -> i64 {
        self.inner.lock().map(|i| i.change_number).unwrap_or(-1)
    }

    fn set_change_number(&self, change_number: i64) -> StorageResult<()> {
        self.inner.lock().unwrap().change_number = change_number;
        Ok(())
    }

    fn get(&self, name: &str) -> StorageResult<Option<Split>> {
        Ok(self.inner.lock().unwrap().splits.get(name).cloned())
    }

    fn get_all(&self) -> StorageResult<Vec<Split>> {
        Ok(self.inner.lock().unwrap().splits.values().cloned().collect())
    }

    fn split_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().splits.keys().cloned().collect())
    }

    fn kill_locally(
        &self,
        name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(split) = inner.splits.get_mut(name) else {
            return Ok(false);
        };
        if change_number <= split.change_number {
            return Ok(false);
        }
        split.killed = true;
        split.default_treatment = default_treatment.to_string();
        split.change_number = change_number;
        Ok(true)
    }

    fn traffic_type_exists(&self, traffic_type: &str) -> bool {
        // A poisoned lock counts as a match.
        self.inner
            .lock()
            .map(|i| i.traffic_types.contains_key(traffic_type))
            .unwrap_or(true)
    }

    fn uses_segments(&self) -> bool {
        self.inner.lock().map(|i| i.segment_users > 0).unwrap_or(false)
    }
}
