//! HTTP service layer for the flagsync engine.
//!
//! Two small clients over reqwest:
//!
//! - [`FlagsApiClient`] — split changes, segment changes, and per-key
//!   membership fetches
//! - [`AuthClient`] — streaming session authentication, including JWT
//!   payload decoding into a [`StreamingToken`]
//!
//! Neither client retries; scheduling and backoff live in the engine
//! that calls them.

mod auth;
mod client;
mod config;
mod error;
mod types;

pub use auth::{decode_streaming_token, AuthClient};
pub use client::FlagsApiClient;
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use types::{AuthResponse, MembershipsResponse, SegmentChanges, SplitChanges, StreamingToken};
