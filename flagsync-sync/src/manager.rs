//! Sync manager: the orchestration loop tying push and polling together.
//!
//! The manager owns all other components. It consumes commands from the
//! application and feedback/update events from the push subsystem in one
//! select loop, promoting and demoting between streaming and polling as the
//! stream's health changes.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::PushEvent;
use crate::notifications::{bitmap_contains, hash_key};
use crate::polling::PollingManager;
use crate::push::PushManager;
use crate::streaming::StreamingTransport;
use crate::submitter::Submitter;
use crate::task::TaskContext;
use crate::updaters::{MembershipsUpdater, SegmentsUpdater, SplitsPass, SplitsUpdater};
use flagsync_api::{AuthClient, FlagsApiClient};
use flagsync_storage::{MembershipsCache, SegmentsCache, SplitsCache};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands accepted by the sync manager.
#[derive(Debug)]
pub enum SyncCommand {
    /// Start synchronization: initial full sync, then push or polling.
    Start,
    /// Stop all synchronization activity.
    Stop,
    /// Attach a user key for per-key membership tracking.
    AddClient { user_key: String },
    /// Detach a user key and drop its cached memberships.
    RemoveClient { user_key: String },
    /// Run every fetch once, on demand.
    SyncAll,
    /// Terminate the manager loop.
    Shutdown,
}

/// Handle for sending commands to the sync manager.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl SyncHandle {
    pub async fn start(&self) -> SyncResult<()> {
        self.send(SyncCommand::Start).await
    }

    pub async fn stop(&self) -> SyncResult<()> {
        self.send(SyncCommand::Stop).await
    }

    pub async fn add_client(&self, user_key: impl Into<String>) -> SyncResult<()> {
        self.send(SyncCommand::AddClient {
            user_key: user_key.into(),
        })
        .await
    }

    pub async fn remove_client(&self, user_key: impl Into<String>) -> SyncResult<()> {
        self.send(SyncCommand::RemoveClient {
            user_key: user_key.into(),
        })
        .await
    }

    pub async fn sync_all(&self) -> SyncResult<()> {
        self.send(SyncCommand::SyncAll).await
    }

    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Shutdown).await
    }

    async fn send(&self, cmd: SyncCommand) -> SyncResult<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// The sync manager.
pub struct SyncManager {
    config: SyncConfig,
    polling: Arc<PollingManager>,
    push: Option<Arc<PushManager>>,
    splits_updater: Arc<SplitsUpdater>,
    segments_updater: Arc<SegmentsUpdater>,
    memberships_updater: Arc<MembershipsUpdater>,
    splits: Arc<dyn SplitsCache>,
    memberships: Arc<dyn MembershipsCache>,
    submitter: Option<Arc<dyn Submitter>>,
    command_rx: mpsc::Receiver<SyncCommand>,
    event_rx: mpsc::Receiver<PushEvent>,
    running: bool,
    started_once: bool,
}

impl SyncManager {
    /// Runs the manager loop until shut down.
    pub async fn run(mut self) {
        info!("sync manager started");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("command channel closed, stopping sync manager");
                        self.stop_all().await;
                        break;
                    };
                    debug!("received command: {cmd:?}");
                    match cmd {
                        SyncCommand::Shutdown => {
                            self.stop_all().await;
                            break;
                        }
                        SyncCommand::Start => self.start_sync().await,
                        SyncCommand::Stop => self.stop_all().await,
                        SyncCommand::AddClient { user_key } => self.add_client(&user_key).await,
                        SyncCommand::RemoveClient { user_key } => self.remove_client(&user_key).await,
                        SyncCommand::SyncAll => {
                            if let Err(e) = self.polling.sync_all().await {
                                warn!("on-demand full sync failed: {e}");
                            }
                        }
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_push_event(event).await;
                }
            }
        }

        info!("sync manager stopped");
    }

    async fn start_sync(&mut self) {
        if self.running {
            debug!("sync already running");
            return;
        }
        self.running = true;

        match &self.push {
            Some(push) => {
                // Caches are seeded only on the very first start; the
                // catch-up sync when the stream comes up covers restarts.
                if !self.started_once {
                    self.started_once = true;
                    if let Err(e) = self.polling.sync_all().await {
                        warn!("initial full sync failed: {e}");
                    }
                }
                push.start();
            }
            None => self.polling.start(),
        }

        if self.config.user_consent.is_granted() {
            if let Some(submitter) = &self.submitter {
                submitter.start();
            }
        }
    }

    async fn stop_all(&mut self) {
        if let Some(push) = &self.push {
            push.stop().await;
        }
        if self.polling.is_running() {
            self.polling.stop();
        }
        if let Some(submitter) = &self.submitter {
            submitter.stop();
        }
        self.running = false;
    }

    async fn add_client(&mut self, user_key: &str) {
        let task = self.polling.add_key(user_key);

        if self.polling.is_running() {
            // Periodic refresh only matters while some split references a
            // segment; otherwise the task stays registered but idle.
            if self.splits.uses_segments() {
                task.start();
            }
        } else if self.running {
            // Streaming is covering; seed the new key once.
            if let Err(e) = task.execute().await {
                warn!("initial memberships fetch for {user_key} failed: {e}");
            }
        }

        if let Some(push) = &self.push {
            push.add_key(user_key).await;
        }
    }

    async fn remove_client(&mut self, user_key: &str) {
        if !self.polling.remove_key(user_key) {
            debug!("client {user_key} was not attached");
            return;
        }
        if let Some(push) = &self.push {
            push.remove_key(user_key);
        }
        if let Err(e) = self.memberships.remove_key(user_key) {
            warn!("failed dropping memberships for {user_key}: {e}");
        }
        info!("detached client {user_key}");
    }

    async fn handle_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::Up => {
                info!("streaming up, polling on standby");
                if self.polling.is_running() {
                    self.polling.stop();
                }
                // Catch up on anything missed while the stream was unusable.
                if let Err(e) = self.polling.sync_all().await {
                    warn!("full sync after stream recovery failed: {e}");
                }
            }
            PushEvent::Down | PushEvent::Retryable => {
                if self.running && !self.polling.is_running() {
                    info!("streaming down, polling takes over");
                    self.polling.start();
                }
            }
            PushEvent::NonRetryable => {
                warn!("streaming unavailable for the rest of the session");
                if let Some(push) = &self.push {
                    push.stop().await;
                }
                if self.running && !self.polling.is_running() {
                    self.polling.start();
                }
            }
            PushEvent::Reset => {
                if let Err(e) = self.polling.sync_all().await {
                    warn!("full sync after stream reset failed: {e}");
                }
            }
            PushEvent::SplitsChanged { change_number } => {
                match self.splits_updater.sync_if_older(change_number).await {
                    Ok(pass) => self.cover_new_segments(pass).await,
                    Err(e) => warn!("targeted split fetch failed: {e}"),
                }
            }
            PushEvent::SplitKilled {
                change_number,
                split_name,
                default_treatment,
            } => {
                match self
                    .splits_updater
                    .kill(&split_name, &default_treatment, change_number)
                    .await
                {
                    Ok(pass) => self.cover_new_segments(pass).await,
                    Err(e) => warn!("split kill handling failed: {e}"),
                }
            }
            PushEvent::SegmentChanged {
                change_number,
                segment_name,
            } => {
                if let Err(e) = self
                    .segments_updater
                    .sync_segment(&segment_name, Some(change_number), &TaskContext::detached())
                    .await
                {
                    warn!("targeted segment fetch failed: {e}");
                }
            }
            PushEvent::MembershipsChanged {
                user_key,
                segments,
                change_number,
            } => match segments {
                Some(segments) => {
                    match self.memberships.reset(&user_key, segments, change_number) {
                        Ok(true) => debug!("memberships replaced for {user_key}"),
                        Ok(false) => {}
                        Err(e) => warn!("memberships write failed for {user_key}: {e}"),
                    }
                }
                None => {
                    if let Err(e) = self
                        .memberships_updater
                        .sync_key(&user_key, change_number, &TaskContext::detached())
                        .await
                    {
                        warn!("targeted memberships fetch for {user_key} failed: {e}");
                    }
                }
            },
            PushEvent::MembershipsUnbounded { change_number } => {
                self.refresh_keys(self.polling.keys(), change_number).await;
            }
            PushEvent::MembershipsBounded {
                bitmap,
                change_number,
            } => {
                let keys: Vec<String> = self
                    .polling
                    .keys()
                    .into_iter()
                    .filter(|key| bitmap_contains(&bitmap, hash_key(key)))
                    .collect();
                self.refresh_keys(keys, change_number).await;
            }
            PushEvent::MembershipsKeyList {
                segment_name,
                added,
                removed,
                change_number,
            } => {
                self.apply_key_list(&segment_name, &added, &removed, change_number);
            }
            PushEvent::MembershipsSegmentRemoved {
                segment_name,
                change_number,
            } => match self.memberships.remove_from_all(&segment_name, change_number) {
                Ok(count) if count > 0 => {
                    info!("segment {segment_name} removed from {count} keys");
                }
                Ok(_) => {}
                Err(e) => warn!("segment removal write failed: {e}"),
            },
        }
    }

    /// Fetches segments a targeted splits pass registered for the first
    /// time. While streaming covers updates the periodic segment sweep is
    /// stopped, so without this a fresh reference would stay empty until
    /// its first segment notification.
    async fn cover_new_segments(&self, pass: SplitsPass) {
        if !pass.new_segments {
            return;
        }
        if let Err(e) = self.polling.sync_new_segments().await {
            warn!("fetch of newly referenced segments failed: {e}");
        }
    }

    /// Re-fetches memberships for the given keys concurrently.
    async fn refresh_keys(&self, keys: Vec<String>, change_number: i64) {
        if keys.is_empty() {
            return;
        }
        let ctx = TaskContext::detached();
        let fetches = keys
            .iter()
            .map(|key| self.memberships_updater.sync_key(key, change_number, &ctx));
        for (key, result) in keys.iter().zip(join_all(fetches).await) {
            if let Err(e) = result {
                warn!("memberships refresh for {key} failed: {e}");
            }
        }
    }

    /// Applies a key-list update to every attached key it addresses.
    fn apply_key_list(
        &self,
        segment_name: &str,
        added: &[u64],
        removed: &[u64],
        change_number: i64,
    ) {
        for key in self.polling.keys() {
            let key_hash = hash_key(&key);
            let result = if added.contains(&key_hash) {
                self.memberships.add(&key, segment_name, change_number)
            } else if removed.contains(&key_hash) {
                self.memberships.remove(&key, segment_name, change_number)
            } else {
                continue;
            };
            if let Err(e) = result {
                warn!("key list write for {key} failed: {e}");
            }
        }
    }
}

/// Creates a sync manager and the handle used to drive it.
///
/// The caller spawns [`SyncManager::run`]. With streaming disabled in the
/// config the transport is never used and the manager runs polling only.
#[allow(clippy::too_many_arguments)]
pub fn create_sync_manager(
    config: SyncConfig,
    api: FlagsApiClient,
    auth: AuthClient,
    transport: Arc<dyn StreamingTransport>,
    splits: Arc<dyn SplitsCache>,
    segments: Arc<dyn SegmentsCache>,
    memberships: Arc<dyn MembershipsCache>,
    submitter: Option<Arc<dyn Submitter>>,
) -> (SyncHandle, SyncManager) {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(64);

    let splits_updater = Arc::new(SplitsUpdater::new(
        api.clone(),
        splits.clone(),
        segments.clone(),
    ));
    let segments_updater = Arc::new(SegmentsUpdater::new(api.clone(), segments));
    let memberships_updater = Arc::new(MembershipsUpdater::new(api, memberships.clone()));

    let polling = Arc::new(PollingManager::new(
        &config,
        splits_updater.clone(),
        segments_updater.clone(),
        memberships_updater.clone(),
    ));

    let push = config
        .streaming_enabled
        .then(|| Arc::new(PushManager::new(auth, transport, config.clone(), event_tx)));

    let handle = SyncHandle { command_tx };
    let manager = SyncManager {
        config,
        polling,
        push,
        splits_updater,
        segments_updater,
        memberships_updater,
        splits,
        memberships,
        submitter,
        command_rx,
        event_rx,
        running: false,
        started_once: false,
    };

    (handle, manager)
}
