//! Fetch-and-apply updaters bridging the API clients and the caches.
//!
//! Each updater pulls remote state, compares change numbers against the
//! cache and applies only what is newer. Change-number gating lives in the
//! caches too; the comparisons here just avoid pointless fetches when a
//! targeted notification is already covered.

use crate::error::SyncResult;
use crate::task::{SyncJob, TaskContext};
use async_trait::async_trait;
use flagsync_api::FlagsApiClient;
use flagsync_storage::{MembershipsCache, SegmentsCache, SplitsCache};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Splits ───────────────────────────────────────────────────────────────

/// Outcome of one splits pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitsPass {
    /// Whether the cache advanced.
    pub applied: bool,
    /// Whether the pass registered segments not seen before.
    pub new_segments: bool,
}

/// Keeps the splits cache in step with `/splitChanges`.
pub struct SplitsUpdater {
    api: FlagsApiClient,
    splits: Arc<dyn SplitsCache>,
    segments: Arc<dyn SegmentsCache>,
}

impl SplitsUpdater {
    pub fn new(
        api: FlagsApiClient,
        splits: Arc<dyn SplitsCache>,
        segments: Arc<dyn SegmentsCache>,
    ) -> Self {
        Self {
            api,
            splits,
            segments,
        }
    }

    /// Fetches changes since the cached change number and applies them.
    pub async fn sync(&self, ctx: &TaskContext) -> SyncResult<SplitsPass> {
        let since = self.splits.change_number();
        let changes = self.api.split_changes(since).await?;

        if !ctx.is_active() {
            debug!("discarding split changes fetched after stop");
            return Ok(SplitsPass::default());
        }
        if changes.till <= since {
            debug!("no split changes past {since}");
            return Ok(SplitsPass::default());
        }

        let mut to_add = Vec::new();
        let mut to_remove = Vec::new();
        let mut referenced: Vec<String> = Vec::new();
        for split in changes.splits {
            if split.is_archived() {
                to_remove.push(split);
            } else {
                referenced.extend(split.segment_names());
                to_add.push(split);
            }
        }

        // Newly referenced segments must be registered before the polling
        // scheduler's next segment pass.
        let mut new_segments = false;
        if !referenced.is_empty() {
            referenced.sort();
            referenced.dedup();
            new_segments = self.segments.register_segments(&referenced)?;
        }

        let applied = self
            .splits
            .update(to_add, to_remove, changes.till)?;
        if applied {
            info!("splits updated to change number {}", changes.till);
        } else {
            debug!("split changes at {} were stale", changes.till);
        }
        Ok(SplitsPass {
            applied,
            new_segments,
        })
    }

    /// Fetches only when the cache is behind the target change number.
    pub async fn sync_if_older(&self, target_change_number: i64) -> SyncResult<SplitsPass> {
        if target_change_number <= self.splits.change_number() {
            debug!("split change {target_change_number} already covered");
            return Ok(SplitsPass::default());
        }
        self.sync(&TaskContext::detached()).await
    }

    /// Applies a kill locally for instant effect, then catches up to the
    /// kill's change number.
    pub async fn kill(
        &self,
        split_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> SyncResult<SplitsPass> {
        let killed = self
            .splits
            .kill_locally(split_name, default_treatment, change_number)?;
        if killed {
            info!("split {split_name} killed locally");
        }
        self.sync_if_older(change_number).await
    }
}

// ── Segments (single-client mode) ────────────────────────────────────────

/// Keeps registered segments in step with `/segmentChanges`.
pub struct SegmentsUpdater {
    api: FlagsApiClient,
    segments: Arc<dyn SegmentsCache>,
}

impl SegmentsUpdater {
    pub fn new(api: FlagsApiClient, segments: Arc<dyn SegmentsCache>) -> Self {
        Self { api, segments }
    }

    /// Fetches one segment's diff. With a target change number the fetch is
    /// skipped when the cache already covers it.
    pub async fn sync_segment(
        &self,
        name: &str,
        target_change_number: Option<i64>,
        ctx: &TaskContext,
    ) -> SyncResult<bool> {
        let since = self.segments.change_number(name);
        if let Some(target) = target_change_number {
            if target <= since {
                debug!("segment {name} change {target} already covered");
                return Ok(false);
            }
        }

        let changes = self.api.segment_changes(name, since).await?;
        if !ctx.is_active() {
            debug!("discarding segment changes fetched after stop");
            return Ok(false);
        }

        let applied = self
            .segments
            .update(name, changes.added, changes.removed, changes.till)?;
        if applied {
            debug!("segment {name} updated to change number {}", changes.till);
        }
        Ok(applied)
    }

    /// Fetches registered segments, best effort. With `only_new`, segments
    /// that already have a change number are skipped; a splits pass that
    /// registered fresh names uses this to cover them right away instead of
    /// leaving them to the next periodic sweep.
    pub async fn sync_all(&self, ctx: &TaskContext, only_new: bool) -> SyncResult<()> {
        for name in self.segments.registered_segments()? {
            if !ctx.is_active() {
                break;
            }
            if only_new && self.segments.change_number(&name) > -1 {
                continue;
            }
            if let Err(e) = self.sync_segment(&name, None, ctx).await {
                warn!("segment {name} fetch failed: {e}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncJob for SegmentsUpdater {
    async fn run(&self, ctx: &TaskContext) -> SyncResult<()> {
        self.sync_all(ctx, false).await
    }
}

// ── Memberships (multi-client mode) ──────────────────────────────────────

/// Keeps per-key memberships in step with `/memberships/{key}`.
pub struct MembershipsUpdater {
    api: FlagsApiClient,
    memberships: Arc<dyn MembershipsCache>,
}

impl MembershipsUpdater {
    pub fn new(api: FlagsApiClient, memberships: Arc<dyn MembershipsCache>) -> Self {
        Self { api, memberships }
    }

    /// Re-fetches one key's memberships. A target of `-1` fetches
    /// unconditionally; otherwise the fetch is skipped when the key's cache
    /// already covers the target change number.
    pub async fn sync_key(
        &self,
        user_key: &str,
        target_change_number: i64,
        ctx: &TaskContext,
    ) -> SyncResult<bool> {
        if target_change_number > -1
            && target_change_number <= self.memberships.change_number(user_key)
        {
            debug!("memberships change {target_change_number} for {user_key} already covered");
            return Ok(false);
        }

        let resp = self.api.memberships(user_key).await?;
        if !ctx.is_active() {
            debug!("discarding memberships fetched after stop");
            return Ok(false);
        }

        let changed = self
            .memberships
            .reset(user_key, resp.segments, target_change_number)?;
        if changed {
            info!("memberships updated for key {user_key}");
        }
        Ok(changed)
    }
}

/// Periodic membership refresh job for one attached user key.
pub struct KeyMembershipsJob {
    updater: Arc<MembershipsUpdater>,
    user_key: String,
}

impl KeyMembershipsJob {
    pub fn new(updater: Arc<MembershipsUpdater>, user_key: impl Into<String>) -> Self {
        Self {
            updater,
            user_key: user_key.into(),
        }
    }
}

#[async_trait]
impl SyncJob for KeyMembershipsJob {
    async fn run(&self, ctx: &TaskContext) -> SyncResult<()> {
        self.updater.sync_key(&self.user_key, -1, ctx).await.map(|_| ())
    }
}
