//! Transport abstraction for the streaming connection.
//!
//! The push manager talks to the stream through these traits so tests can
//! script connections without a network. The production implementation is
//! [`crate::sse::SseClient`].

use crate::error::SyncResult;
use async_trait::async_trait;
use flagsync_api::StreamingToken;

/// A raw event surfaced by a streaming connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStreamEvent {
    /// The connection is established.
    Opened,
    /// A data message: the JSON envelope text.
    Message(String),
    /// A stream-level error, with the error payload when the backend sent
    /// one. `None` means the connection failed without a payload.
    Error(Option<String>),
}

/// Opens streaming connections.
#[async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Opens a connection subscribed to `channels` using `token`.
    async fn connect(
        &self,
        token: &StreamingToken,
        channels: &[String],
    ) -> SyncResult<Box<dyn StreamingConnection>>;
}

/// One live streaming connection.
#[async_trait]
pub trait StreamingConnection: Send {
    /// Next event from the stream, or `None` once the connection is closed.
    async fn next_event(&mut self) -> Option<RawStreamEvent>;

    /// Tears the connection down.
    async fn close(&mut self);
}
