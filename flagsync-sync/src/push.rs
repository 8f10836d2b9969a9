//! Push manager: streaming session lifecycle.
//!
//! Owns authentication, the streaming connection, reconnect backoff and
//! token refresh. Decoded update notifications are forwarded over the event
//! channel only while the keeper reports the stream usable; connection
//! feedback events drive the manager's polling handover.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::events::PushEvent;
use crate::keeper::{KeeperSignal, NotificationKeeper};
use crate::notifications::{self, decode_message, MembershipsV2Update, Notification};
use crate::streaming::{RawStreamEvent, StreamingConnection, StreamingTransport};
use flagsync_api::AuthClient;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum SessionCommand {
    Stop,
    /// Tear down the current connection and re-authenticate. Used when the
    /// attached key set changes and on planned token refresh.
    Reconnect,
}

enum SessionOutcome {
    /// Planned reconnect (token refresh, key change, stream reset): no backoff.
    Reconnect,
    /// Connection failed; retry after backoff.
    Retry,
    /// The session is over, either stopped or permanently failed.
    Shutdown,
}

struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    active: Arc<AtomicBool>,
}

/// Manages the push side of synchronization: one streaming session at a
/// time, re-established across token refreshes and transient failures.
pub struct PushManager {
    auth: AuthClient,
    transport: Arc<dyn StreamingTransport>,
    config: SyncConfig,
    event_tx: mpsc::Sender<PushEvent>,
    /// Channel token -> user key, for routing per-key membership channels.
    routing: Arc<Mutex<HashMap<String, String>>>,
    session: Mutex<Option<SessionHandle>>,
}

impl PushManager {
    pub fn new(
        auth: AuthClient,
        transport: Arc<dyn StreamingTransport>,
        config: SyncConfig,
        event_tx: mpsc::Sender<PushEvent>,
    ) -> Self {
        Self {
            auth,
            transport,
            config,
            event_tx,
            routing: Arc::new(Mutex::new(HashMap::new())),
            session: Mutex::new(None),
        }
    }

    /// Spawns the session loop. Idempotent while a session is running.
    pub fn start(&self) {
        let mut session = self.session.lock().unwrap();
        if session
            .as_ref()
            .is_some_and(|s| s.active.load(Ordering::SeqCst))
        {
            info!("push manager already running");
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let active = Arc::new(AtomicBool::new(true));
        *session = Some(SessionHandle {
            cmd_tx,
            active: active.clone(),
        });

        info!("starting push manager");
        let session_loop = SessionLoop {
            auth: self.auth.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
            routing: self.routing.clone(),
            active,
        };
        tokio::spawn(session_loop.run(cmd_rx));
    }

    /// Tears the session down. Idempotent.
    pub async fn stop(&self) {
        let handle = self.session.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.active.store(false, Ordering::SeqCst);
            let _ = handle.cmd_tx.send(SessionCommand::Stop).await;
            info!("stopping push manager");
        }
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.active.load(Ordering::SeqCst))
    }

    /// Attaches a user key. A running session reconnects so the new token
    /// covers the key's membership channel.
    pub async fn add_key(&self, user_key: &str) {
        let token = notifications::channel_token(user_key);
        self.routing
            .lock()
            .unwrap()
            .insert(token, user_key.to_string());
        if let Some(cmd_tx) = self.cmd_sender() {
            let _ = cmd_tx.send(SessionCommand::Reconnect).await;
        }
    }

    /// Detaches a user key. The stale channel subscription is harmless, so
    /// no reconnect happens until the next one anyway.
    pub fn remove_key(&self, user_key: &str) {
        let token = notifications::channel_token(user_key);
        self.routing.lock().unwrap().remove(&token);
    }

    fn cmd_sender(&self) -> Option<mpsc::Sender<SessionCommand>> {
        let session = self.session.lock().unwrap();
        session
            .as_ref()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .map(|s| s.cmd_tx.clone())
    }
}

// ── Session loop ─────────────────────────────────────────────────────────

struct SessionLoop {
    auth: AuthClient,
    transport: Arc<dyn StreamingTransport>,
    config: SyncConfig,
    event_tx: mpsc::Sender<PushEvent>,
    routing: Arc<Mutex<HashMap<String, String>>>,
    active: Arc<AtomicBool>,
}

impl SessionLoop {
    async fn run(self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        let base = Duration::from_secs(self.config.backoff_base_secs);
        let max = Duration::from_secs(self.config.backoff_max_secs);
        let mut auth_backoff = Backoff::new(base, max);
        let mut connect_backoff = Backoff::new(base, max);
        let stability = Duration::from_secs(self.config.backoff_stability_secs);
        let mut keeper = NotificationKeeper::new();

        loop {
            let user_keys: Vec<String> =
                { self.routing.lock().unwrap().values().cloned().collect() };

            let token = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Reconnect) => continue,
                    _ => break,
                },
                result = self.auth.authenticate(&user_keys) => result,
            };

            let token = match token {
                Ok(token) if !token.push_enabled => {
                    info!("push disabled for this environment");
                    let _ = self.event_tx.send(PushEvent::NonRetryable).await;
                    break;
                }
                Ok(token) => {
                    auth_backoff.reset();
                    token
                }
                Err(e) if e.is_client_error() => {
                    warn!("streaming auth rejected: {e}");
                    let _ = self.event_tx.send(PushEvent::NonRetryable).await;
                    break;
                }
                Err(e) => {
                    warn!("streaming auth failed: {e}");
                    let _ = self.event_tx.send(PushEvent::Retryable).await;
                    if !self.wait_or_stop(&mut cmd_rx, auth_backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let channels = subscription_channels(&token.channels);
            let conn = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Reconnect) => continue,
                    _ => break,
                },
                result = self.transport.connect(&token, &channels) => result,
            };
            let mut conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("streaming connect failed: {e}");
                    let _ = self.event_tx.send(PushEvent::Retryable).await;
                    if !self
                        .wait_or_stop(&mut cmd_rx, connect_backoff.next_delay())
                        .await
                    {
                        break;
                    }
                    continue;
                }
            };

            keeper.reset();
            let refresh_in = token_refresh_delay(
                token.lifetime_secs(),
                self.config.token_refresh_margin_secs,
            );

            let (outcome, open_duration) = self
                .run_connection(&mut *conn, &mut cmd_rx, &mut keeper, refresh_in)
                .await;
            conn.close().await;

            // A connection that held long enough proves the route works
            // again; start the retry schedule over.
            if open_duration.is_some_and(|d| d >= stability) {
                connect_backoff.reset();
            }

            match outcome {
                SessionOutcome::Reconnect => continue,
                SessionOutcome::Retry => {
                    let _ = self.event_tx.send(PushEvent::Retryable).await;
                    let delay = connect_backoff.next_delay();
                    warn!("streaming connection lost, reconnecting in {delay:?}");
                    if !self.wait_or_stop(&mut cmd_rx, delay).await {
                        break;
                    }
                }
                SessionOutcome::Shutdown => break,
            }
        }

        self.active.store(false, Ordering::SeqCst);
        debug!("push session loop exited");
    }

    /// Sleeps for `delay` unless a command arrives first. Returns `false`
    /// when the session should shut down instead of continuing.
    async fn wait_or_stop(
        &self,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
        delay: Duration,
    ) -> bool {
        tokio::select! {
            cmd = cmd_rx.recv() => matches!(cmd, Some(SessionCommand::Reconnect)),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run_connection(
        &self,
        conn: &mut dyn StreamingConnection,
        cmd_rx: &mut mpsc::Receiver<SessionCommand>,
        keeper: &mut NotificationKeeper,
        refresh_in: Duration,
    ) -> (SessionOutcome, Option<Duration>) {
        let mut opened_at: Option<Instant> = None;
        let refresh = tokio::time::sleep(refresh_in);
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let outcome = match cmd {
                        Some(SessionCommand::Reconnect) => {
                            info!("reconnecting streaming session");
                            SessionOutcome::Reconnect
                        }
                        _ => SessionOutcome::Shutdown,
                    };
                    return (outcome, opened_at.map(|t| t.elapsed()));
                }
                _ = &mut refresh => {
                    info!("streaming token expiring, reconnecting with a fresh one");
                    return (SessionOutcome::Reconnect, opened_at.map(|t| t.elapsed()));
                }
                event = conn.next_event() => match event {
                    Some(RawStreamEvent::Opened) => {
                        debug!("streaming connection open");
                        opened_at = Some(Instant::now());
                    }
                    Some(RawStreamEvent::Message(raw)) => {
                        if let Some(outcome) = self.handle_message(&raw, keeper).await {
                            return (outcome, opened_at.map(|t| t.elapsed()));
                        }
                    }
                    Some(RawStreamEvent::Error(payload)) => {
                        let outcome = if is_retryable_stream_error(payload.as_deref()) {
                            warn!("retryable stream error");
                            SessionOutcome::Retry
                        } else {
                            warn!("non-retryable stream error, streaming is off for this session");
                            let _ = self.event_tx.send(PushEvent::NonRetryable).await;
                            SessionOutcome::Shutdown
                        };
                        return (outcome, opened_at.map(|t| t.elapsed()));
                    }
                    None => {
                        debug!("stream closed by server");
                        return (SessionOutcome::Retry, opened_at.map(|t| t.elapsed()));
                    }
                },
            }
        }
    }

    /// Processes one decoded message. Returns an outcome when the message
    /// ends the current connection.
    async fn handle_message(
        &self,
        raw: &str,
        keeper: &mut NotificationKeeper,
    ) -> Option<SessionOutcome> {
        match decode_message(raw)? {
            Notification::Occupancy {
                publishers,
                channel,
                timestamp,
            } => {
                self.forward_signal(keeper.handle_occupancy(&channel, publishers, timestamp))
                    .await
            }
            Notification::Control {
                control_type,
                channel,
                timestamp,
            } => {
                self.forward_signal(keeper.handle_control(&channel, control_type, timestamp))
                    .await
            }
            // Reset bypasses usability gating: it must act even on a
            // stream that never reported occupancy.
            Notification::StreamingReset => {
                info!("stream reset requested by backend");
                let _ = self.event_tx.send(PushEvent::Reset).await;
                Some(SessionOutcome::Reconnect)
            }
            update => {
                if keeper.is_usable() {
                    if let Some(event) = self.update_event(update) {
                        let _ = self.event_tx.send(event).await;
                    }
                } else {
                    debug!("stream not usable, dropping update notification");
                }
                None
            }
        }
    }

    async fn forward_signal(&self, signal: Option<KeeperSignal>) -> Option<SessionOutcome> {
        match signal? {
            KeeperSignal::Usable => {
                let _ = self.event_tx.send(PushEvent::Up).await;
                None
            }
            KeeperSignal::Unusable => {
                let _ = self.event_tx.send(PushEvent::Down).await;
                None
            }
            KeeperSignal::Fatal => {
                warn!("streaming disabled by backend control");
                let _ = self.event_tx.send(PushEvent::NonRetryable).await;
                Some(SessionOutcome::Shutdown)
            }
        }
    }

    fn update_event(&self, notification: Notification) -> Option<PushEvent> {
        match notification {
            Notification::SplitUpdate { change_number } => {
                Some(PushEvent::SplitsChanged { change_number })
            }
            Notification::SplitKill {
                change_number,
                split_name,
                default_treatment,
            } => Some(PushEvent::SplitKilled {
                change_number,
                split_name,
                default_treatment,
            }),
            Notification::SegmentUpdate {
                change_number,
                segment_name,
            } => Some(PushEvent::SegmentChanged {
                change_number,
                segment_name,
            }),
            Notification::MembershipsUpdate {
                change_number,
                segments,
                channel,
            } => {
                let token = notifications::token_from_channel(&channel)?;
                let user_key = self.routing.lock().unwrap().get(token).cloned();
                match user_key {
                    Some(user_key) => Some(PushEvent::MembershipsChanged {
                        user_key,
                        segments,
                        change_number,
                    }),
                    None => {
                        debug!("membership update for unknown channel {channel}");
                        None
                    }
                }
            }
            Notification::MembershipsUpdateV2 {
                change_number,
                update,
            } => Some(match update {
                MembershipsV2Update::Unbounded => PushEvent::MembershipsUnbounded { change_number },
                MembershipsV2Update::BoundedBitmap(bitmap) => PushEvent::MembershipsBounded {
                    bitmap,
                    change_number,
                },
                MembershipsV2Update::KeyList {
                    segment_name,
                    added,
                    removed,
                } => PushEvent::MembershipsKeyList {
                    segment_name,
                    added,
                    removed,
                    change_number,
                },
                MembershipsV2Update::SegmentRemoval { segment_name } => {
                    PushEvent::MembershipsSegmentRemoved {
                        segment_name,
                        change_number,
                    }
                }
            }),
            // Occupancy, control and reset never reach this point.
            _ => None,
        }
    }
}

/// Control channels subscribe with the occupancy prefix so the backend
/// reports publisher counts for them; data channels subscribe as-is.
fn subscription_channels(channels: &[String]) -> Vec<String> {
    channels
        .iter()
        .map(|channel| {
            if channel.starts_with("control_") {
                notifications::with_occupancy_prefix(channel)
            } else {
                channel.clone()
            }
        })
        .collect()
}

/// Delay before reconnecting with a fresh token: lifetime minus the refresh
/// margin, floored at one second for degenerate tokens.
fn token_refresh_delay(lifetime_secs: i64, margin_secs: i64) -> Duration {
    Duration::from_secs((lifetime_secs - margin_secs).max(1) as u64)
}

#[derive(Deserialize)]
struct StreamErrorPayload {
    #[serde(default)]
    code: Option<i64>,
    #[serde(rename = "statusCode", default)]
    status_code: Option<u16>,
}

/// Decides whether a stream error leaves streaming recoverable.
///
/// Token-expiry codes (40140..40149) recover with a fresh auth; other 4xxxx
/// codes are permanent. Payloads that cannot be parsed, and errors without a
/// payload, are treated as transient network faults.
fn is_retryable_stream_error(payload: Option<&str>) -> bool {
    let Some(raw) = payload else { return true };
    let Ok(parsed) = serde_json::from_str::<StreamErrorPayload>(raw) else {
        return true;
    };

    if let Some(code) = parsed.code {
        if (40140..=40149).contains(&code) {
            return true;
        }
        if (40000..50000).contains(&code) {
            return false;
        }
    }
    match parsed.status_code {
        Some(401) => true,
        Some(status) if (400..500).contains(&status) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_codes_are_retryable() {
        let payload = r#"{"code":40142,"statusCode":401,"message":"token expired"}"#;
        assert!(is_retryable_stream_error(Some(payload)));
        assert!(is_retryable_stream_error(Some(r#"{"code":40140}"#)));
        assert!(is_retryable_stream_error(Some(r#"{"code":40149}"#)));
    }

    #[test]
    fn other_client_codes_are_permanent() {
        let payload = r#"{"code":42910,"statusCode":429,"message":"rate limited"}"#;
        assert!(!is_retryable_stream_error(Some(payload)));
        assert!(!is_retryable_stream_error(Some(r#"{"code":40012}"#)));
    }

    #[test]
    fn server_codes_are_retryable() {
        let payload = r#"{"code":50000,"statusCode":500,"message":"server error"}"#;
        assert!(is_retryable_stream_error(Some(payload)));
    }

    #[test]
    fn status_code_fallback_applies_without_a_code() {
        assert!(is_retryable_stream_error(Some(r#"{"statusCode":401}"#)));
        assert!(!is_retryable_stream_error(Some(r#"{"statusCode":400}"#)));
        assert!(!is_retryable_stream_error(Some(r#"{"statusCode":403}"#)));
        assert!(is_retryable_stream_error(Some(r#"{"statusCode":500}"#)));
    }

    #[test]
    fn missing_or_garbled_payloads_fail_open() {
        assert!(is_retryable_stream_error(None));
        assert!(is_retryable_stream_error(Some("garbage")));
        assert!(is_retryable_stream_error(Some("{}")));
    }

    #[test]
    fn control_channels_get_the_occupancy_prefix() {
        let channels = vec![
            "control_pri".to_string(),
            "control_sec".to_string(),
            "env_splits".to_string(),
        ];
        let subscribed = subscription_channels(&channels);
        assert_eq!(
            subscribed,
            vec![
                "[?occupancy=metrics.publishers]control_pri".to_string(),
                "[?occupancy=metrics.publishers]control_sec".to_string(),
                "env_splits".to_string(),
            ]
        );
    }

    #[test]
    fn refresh_delay_subtracts_margin_with_a_floor() {
        assert_eq!(token_refresh_delay(3600, 600), Duration::from_secs(3000));
        assert_eq!(token_refresh_delay(60, 600), Duration::from_secs(1));
    }
}
