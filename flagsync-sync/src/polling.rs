//! Polling scheduler: periodic fetch tasks and the full-sync fan-out.

use crate::config::{SyncConfig, SyncMode};
use crate::error::SyncResult;
use crate::task::{SyncJob, SyncTask, TaskContext};
use crate::updaters::{KeyMembershipsJob, MembershipsUpdater, SegmentsUpdater, SplitsUpdater};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Periodic splits job. A pass that registers segments not seen before
/// pulls those segments immediately rather than leaving a window until the
/// segments task's next tick.
struct SplitsPollJob {
    splits: Arc<SplitsUpdater>,
    /// Present in single-client mode only; memberships cover the
    /// multi-client case on their own.
    segments: Option<Arc<SegmentsUpdater>>,
}

#[async_trait]
impl SyncJob for SplitsPollJob {
    async fn run(&self, ctx: &TaskContext) -> SyncResult<()> {
        let pass = self.splits.sync(ctx).await?;
        if pass.new_segments {
            if let Some(segments) = &self.segments {
                segments.sync_all(ctx, true).await?;
            }
        }
        Ok(())
    }
}

/// Owns the periodic fetch tasks: one for splits, plus either one global
/// segments task or one memberships task per attached user key.
pub struct PollingManager {
    mode: SyncMode,
    memberships_period: Duration,
    splits_task: Arc<SyncTask>,
    segments_task: Arc<SyncTask>,
    memberships_tasks: Mutex<HashMap<String, Arc<SyncTask>>>,
    splits_updater: Arc<SplitsUpdater>,
    segments_updater: Arc<SegmentsUpdater>,
    memberships_updater: Arc<MembershipsUpdater>,
}

impl PollingManager {
    pub fn new(
        config: &SyncConfig,
        splits_updater: Arc<SplitsUpdater>,
        segments_updater: Arc<SegmentsUpdater>,
        memberships_updater: Arc<MembershipsUpdater>,
    ) -> Self {
        let splits_job = SplitsPollJob {
            splits: splits_updater.clone(),
            segments: (config.mode == SyncMode::SingleClient).then(|| segments_updater.clone()),
        };
        let splits_task = Arc::new(SyncTask::new(
            "splits",
            Duration::from_secs(config.features_refresh_secs),
            Arc::new(splits_job) as Arc<dyn SyncJob>,
        ));
        let segments_task = Arc::new(SyncTask::new(
            "segments",
            Duration::from_secs(config.segments_refresh_secs),
            segments_updater.clone() as Arc<dyn SyncJob>,
        ));

        Self {
            mode: config.mode,
            memberships_period: Duration::from_secs(config.segments_refresh_secs),
            splits_task,
            segments_task,
            memberships_tasks: Mutex::new(HashMap::new()),
            splits_updater,
            segments_updater,
            memberships_updater,
        }
    }

    /// Starts all periodic tasks. Idempotent.
    pub fn start(&self) {
        info!("starting polling");
        self.splits_task.start();
        match self.mode {
            SyncMode::SingleClient => self.segments_task.start(),
            SyncMode::MultiClient => {
                for task in self.memberships_tasks.lock().unwrap().values() {
                    task.start();
                }
            }
        }
    }

    /// Stops all periodic tasks. Idempotent.
    pub fn stop(&self) {
        info!("stopping polling");
        self.splits_task.stop();
        self.segments_task.stop();
        for task in self.memberships_tasks.lock().unwrap().values() {
            task.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.splits_task.is_running()
    }

    /// Registers a memberships task for a user key and returns it. The task
    /// is not started here; the caller decides based on current sync state.
    /// Re-attaching an existing key returns the existing task.
    pub fn add_key(&self, user_key: &str) -> Arc<SyncTask> {
        let mut tasks = self.memberships_tasks.lock().unwrap();
        if let Some(task) = tasks.get(user_key) {
            return task.clone();
        }
        let job = KeyMembershipsJob::new(self.memberships_updater.clone(), user_key);
        let task = Arc::new(SyncTask::new(
            format!("memberships:{user_key}"),
            self.memberships_period,
            Arc::new(job) as Arc<dyn SyncJob>,
        ));
        tasks.insert(user_key.to_string(), task.clone());
        task
    }

    /// Stops and drops the memberships task for a user key. Returns whether
    /// the key was attached.
    pub fn remove_key(&self, user_key: &str) -> bool {
        let task = self.memberships_tasks.lock().unwrap().remove(user_key);
        match task {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    /// Currently attached user keys.
    pub fn keys(&self) -> Vec<String> {
        self.memberships_tasks.lock().unwrap().keys().cloned().collect()
    }

    /// One-shot fetch of registered segments that have never been fetched.
    /// Used after a targeted splits fetch registers fresh names while the
    /// periodic tasks are stopped. No-op in multi-client mode.
    pub async fn sync_new_segments(&self) -> SyncResult<()> {
        if self.mode == SyncMode::SingleClient {
            self.segments_updater
                .sync_all(&TaskContext::detached(), true)
                .await?;
        }
        Ok(())
    }

    /// Runs every fetch once: splits first (so new segment references get
    /// registered), then all segment or membership fetches concurrently.
    /// Individual failures are logged, never propagated; the slow path must
    /// not wedge on one bad fetch.
    pub async fn sync_all(&self) -> SyncResult<()> {
        let ctx = TaskContext::detached();

        if let Err(e) = self.splits_updater.sync(&ctx).await {
            warn!("full sync: splits fetch failed: {e}");
        }

        match self.mode {
            SyncMode::SingleClient => {
                if let Err(e) = self.segments_updater.sync_all(&ctx, false).await {
                    warn!("full sync: segments fetch failed: {e}");
                }
            }
            SyncMode::MultiClient => {
                let keys = self.keys();
                let fetches = keys
                    .iter()
                    .map(|key| self.memberships_updater.sync_key(key, -1, &ctx));
                for (key, result) in keys.iter().zip(join_all(fetches).await) {
                    if let Err(e) = result {
                        warn!("full sync: memberships fetch for {key} failed: {e}");
                    }
                }
            }
        }

        Ok(())
    }
}
