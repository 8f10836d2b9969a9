//! Per-user-key segment membership cache (client-side mode).
//!
//! One entry per attached user key. Direct writes (key lists, bitmaps,
//! segment removals pushed over the stream) are gated by the key's change
//! number so duplicate deliveries across redundant regions collapse to one
//! apply. Full resets come from a fetch of current server truth and are
//! never gated; they only advance the change number.

use crate::error::StorageResult;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Cache of segment memberships keyed by user key.
pub trait MembershipsCache: Send + Sync {
    /// Replaces a key's memberships with the given set. `change_number`
    /// advances the key's change number when newer; pass `-1` when the
    /// caller has no ordering information. Returns whether the stored set
    /// changed.
    fn reset(&self, key: &str, segments: Vec<String>, change_number: i64) -> StorageResult<bool>;

    /// Adds a key to a segment. Dropped (returns `Ok(false)`) when
    /// `change_number` is not newer than the key's stored one.
    fn add(&self, key: &str, segment: &str, change_number: i64) -> StorageResult<bool>;

    /// Removes a key from a segment, gated like [`MembershipsCache::add`].
    fn remove(&self, key: &str, segment: &str, change_number: i64) -> StorageResult<bool>;

    /// Removes a segment from every tracked key, gated per key. Returns the
    /// number of keys whose memberships changed.
    fn remove_from_all(&self, segment: &str, change_number: i64) -> StorageResult<usize>;

    fn is_in_segment(&self, key: &str, segment: &str) -> StorageResult<bool>;

    /// Change number for a key, `-1` when the key is unknown.
    fn change_number(&self, key: &str) -> i64;

    fn segments_of(&self, key: &str) -> StorageResult<Vec<String>>;

    /// Drops a key entirely (client teardown). Idempotent.
    fn remove_key(&self, key: &str) -> StorageResult<()>;
}

struct KeyMemberships {
    segments: HashSet<String>,
    change_number: i64,
}

impl Default for KeyMemberships {
    fn default() -> Self {
        Self {
            segments: HashSet::new(),
            change_number: -1,
        }
    }
}

/// In-memory implementation of [`MembershipsCache`]. Cheap to clone.
#[derive(Clone, Default)]
pub struct InMemoryMembershipsCache {
    inner: Arc<Mutex<HashMap<String, KeyMemberships>>>,
}

impl InMemoryMembershipsCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MembershipsCache for InMemoryMembershipsCache {
    fn reset(&self, key: &str, segments: Vec<String>, change_number: i64) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(key.to_string()).or_default();
        let next: HashSet<String> = segments.into_iter().collect();
        let changed = next != entry.segments;
        entry.segments = next;
        if change_number > entry.change_number {
            entry.change_number = change_number;
        }
        Ok(changed)
    }

    fn add(&self, key: &str, segment: &str, change_number: i64) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(key.to_string()).or_default();
        if change_number <= entry.change_number {
            return Ok(false);
        }
        entry.change_number = change_number;
        Ok(entry.segments.insert(segment.to_string()))
    }

    fn remove(&self, key: &str, segment: &str, change_number: i64) -> StorageResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(key.to_string()).or_default();
        if change_number <= entry.change_number {
            return Ok(false);
        }
        entry.change_number = change_number;
        Ok(entry.segments.remove(segment))
    }

    fn remove_from_all(&self, segment: &str, change_number: i64) -> StorageResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut affected = 0;
        for entry in inner.values_mut() {
            if change_number <= entry.change_number {
                continue;
            }
            entry.change_number = change_number;
            if entry.segments.remove(segment) {
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn is_in_segment(&self, key: &str, segment: &str) -> StorageResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.segments.contains(segment))
            .unwrap_or(false))
    }

    fn change_number(&self, key: &str) -> i64 {
        self.inner
            .lock()
            .map(|i| i.get(key).map(|e| e.change_number).unwrap_or(-1))
            .unwrap_or(-1)
    }

    fn segments_of(&self, key: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.segments.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_key(&self, key: &str) -> StorageResult<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}
