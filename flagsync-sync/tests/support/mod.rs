//! Shared helpers for the sync engine integration tests: a scriptable
//! streaming transport plus builders for backend payloads.

#![allow(dead_code)]

use async_trait::async_trait;
use flagsync_api::StreamingToken;
use flagsync_sync::{RawStreamEvent, StreamingConnection, StreamingTransport, SyncError, SyncResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Routes engine logs into the captured test output. Only the first call
/// in a process installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

// ── Scripted streaming transport ─────────────────────────────────────────

/// One recorded `connect` call.
#[derive(Debug, Clone)]
pub struct ConnectCall {
    pub token: String,
    pub channels: Vec<String>,
}

/// Streaming transport whose connections are scripted by the test.
///
/// Each queued connection is fed through the sender returned by
/// [`FakeTransport::push_connection`]; `connect` hands connections out in
/// queue order and fails like a network fault once the queue is empty.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<FakeTransportInner>>,
}

#[derive(Default)]
struct FakeTransportInner {
    queued: VecDeque<mpsc::UnboundedReceiver<RawStreamEvent>>,
    calls: Vec<ConnectCall>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one scripted connection and returns the sender driving it.
    /// Dropping the sender ends the connection like a server-side close.
    pub fn push_connection(&self) -> mpsc::UnboundedSender<RawStreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().queued.push_back(rx);
        tx
    }

    /// Every `connect` call made so far.
    pub fn calls(&self) -> Vec<ConnectCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl StreamingTransport for FakeTransport {
    async fn connect(
        &self,
        token: &StreamingToken,
        channels: &[String],
    ) -> SyncResult<Box<dyn StreamingConnection>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ConnectCall {
            token: token.token.clone(),
            channels: channels.to_vec(),
        });
        match inner.queued.pop_front() {
            Some(rx) => Ok(Box::new(FakeConnection { rx, closed: false })),
            None => Err(SyncError::Streaming("no scripted connection".into())),
        }
    }
}

struct FakeConnection {
    rx: mpsc::UnboundedReceiver<RawStreamEvent>,
    closed: bool,
}

#[async_trait]
impl StreamingConnection for FakeConnection {
    async fn next_event(&mut self) -> Option<RawStreamEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// ── Backend payload builders ─────────────────────────────────────────────

/// Unsigned JWT shaped like the streaming auth backend's, granting
/// subscribe rights on the given channels.
pub fn streaming_jwt(channels: &[&str], iat: i64, exp: i64) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let capability: serde_json::Map<String, serde_json::Value> = channels
        .iter()
        .map(|c| (c.to_string(), serde_json::json!(["subscribe"])))
        .collect();
    let payload = serde_json::json!({
        "iat": iat,
        "exp": exp,
        "x-ably-capability": serde_json::Value::Object(capability).to_string(),
    });
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("e30.{body}.c2ln")
}

/// Auth endpoint body for an environment with push enabled.
pub fn auth_body(token: &str) -> serde_json::Value {
    serde_json::json!({ "pushEnabled": true, "token": token })
}

/// A JWT valid for one hour on the standard control and splits channels.
pub fn default_jwt() -> String {
    let now = 1_700_000_000;
    streaming_jwt(
        &["control_pri", "control_sec", "env_splits", "env_segments"],
        now,
        now + 3600,
    )
}

/// Raw SSE message wrapping an inner notification payload, shaped like the
/// envelope the streaming backend sends.
pub fn envelope(channel: &str, inner: serde_json::Value) -> RawStreamEvent {
    let raw = serde_json::json!({
        "id": "m1",
        "timestamp": 1_700_000_000_000_i64,
        "encoding": "json",
        "channel": channel,
        "data": inner.to_string(),
    })
    .to_string();
    RawStreamEvent::Message(raw)
}

/// Occupancy message for a control channel.
pub fn occupancy(channel: &str, publishers: i64, timestamp: i64) -> RawStreamEvent {
    let raw = serde_json::json!({
        "id": "m1",
        "name": "[meta]occupancy",
        "timestamp": timestamp,
        "channel": format!("[?occupancy=metrics.publishers]{channel}"),
        "data": serde_json::json!({"metrics": {"publishers": publishers}}).to_string(),
    })
    .to_string();
    RawStreamEvent::Message(raw)
}

/// Control message for a control channel.
pub fn control(channel: &str, control_type: &str, timestamp: i64) -> RawStreamEvent {
    let raw = serde_json::json!({
        "id": "m1",
        "timestamp": timestamp,
        "channel": format!("[?occupancy=metrics.publishers]{channel}"),
        "data": serde_json::json!({"type": "CONTROL", "controlType": control_type}).to_string(),
    })
    .to_string();
    RawStreamEvent::Message(raw)
}

/// `/splitChanges` body with one active split referencing no segments.
pub fn split_changes_body(since: i64, till: i64, splits: &[serde_json::Value]) -> serde_json::Value {
    serde_json::json!({ "splits": splits, "since": since, "till": till })
}

/// A minimal active split definition.
pub fn split(name: &str, change_number: i64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "trafficTypeName": "user",
        "status": "ACTIVE",
        "killed": false,
        "defaultTreatment": "off",
        "changeNumber": change_number,
        "seed": 1234,
        "conditions": [],
    })
}

/// An active split whose only condition matches a segment.
pub fn split_with_segment(name: &str, segment: &str, change_number: i64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "trafficTypeName": "user",
        "status": "ACTIVE",
        "killed": false,
        "defaultTreatment": "off",
        "changeNumber": change_number,
        "conditions": [{
            "matcherGroup": {
                "combiner": "AND",
                "matchers": [{
                    "matcherType": "IN_SEGMENT",
                    "userDefinedSegmentMatcherData": { "segmentName": segment }
                }]
            },
            "partitions": [{ "treatment": "on", "size": 100 }]
        }],
    })
}

/// An archived split definition.
pub fn archived_split(name: &str, change_number: i64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "trafficTypeName": "user",
        "status": "ARCHIVED",
        "killed": false,
        "defaultTreatment": "off",
        "changeNumber": change_number,
        "conditions": [],
    })
}

/// `/segmentChanges/{name}` body.
pub fn segment_changes_body(
    name: &str,
    added: &[&str],
    removed: &[&str],
    since: i64,
    till: i64,
) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "added": added,
        "removed": removed,
        "since": since,
        "till": till,
    })
}

/// `/memberships/{key}` body.
pub fn memberships_body(segments: &[&str]) -> serde_json::Value {
    serde_json::json!({ "segments": segments })
}
