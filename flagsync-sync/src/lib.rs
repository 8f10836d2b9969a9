//! Hybrid push/poll synchronization engine for flagsync.
//!
//! Keeps the local split, segment, and membership caches current with:
//! - Periodic polling tasks (splits, segments, per-key memberships)
//! - A push channel over SSE that narrows polling to targeted fetches
//! - Automatic fallback to polling whenever the stream degrades
//! - Token-refresh and backoff handling for the streaming session
//!
//! The entry point is [`create_sync_manager`]: spawn [`SyncManager::run`]
//! and drive it through the returned [`SyncHandle`].

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod keeper;
pub mod manager;
pub mod notifications;
pub mod polling;
pub mod push;
pub mod sse;
pub mod streaming;
pub mod submitter;
pub mod task;
pub mod updaters;

pub use config::{SyncConfig, SyncMode, UserConsent};
pub use error::{SyncError, SyncResult};
pub use events::PushEvent;
pub use manager::{create_sync_manager, SyncCommand, SyncHandle, SyncManager};
pub use sse::SseClient;
pub use streaming::{RawStreamEvent, StreamingConnection, StreamingTransport};
pub use submitter::Submitter;
