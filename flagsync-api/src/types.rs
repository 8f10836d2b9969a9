//! Wire DTOs for the synchronization endpoints.

use flagsync_storage::Split;
use serde::Deserialize;

/// Response of `GET /splitChanges?since={n}`.
///
/// `till` is the change number the returned snapshot is valid at; equal
/// `since`/`till` means nothing changed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChanges {
    #[serde(default)]
    pub splits: Vec<Split>,
    pub since: i64,
    pub till: i64,
}

/// Response of `GET /segmentChanges/{name}?since={n}`: a key diff for one
/// segment between two change numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

/// Response of `GET /memberships/{key}`: the full set of segments the key
/// belongs to right now. Carries no version; the caller supplies ordering
/// context when it has any.
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipsResponse {
    #[serde(default)]
    pub segments: Vec<String>,
}

/// Raw response of the streaming auth endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub push_enabled: bool,
    #[serde(default)]
    pub token: String,
}

/// Decoded streaming credentials: the raw JWT plus the claims the push
/// layer needs (channel list for subscription, issue/expiry for refresh
/// scheduling).
#[derive(Debug, Clone)]
pub struct StreamingToken {
    pub push_enabled: bool,
    pub token: String,
    pub channels: Vec<String>,
    /// `iat` claim, seconds since epoch.
    pub issued_at: i64,
    /// `exp` claim, seconds since epoch.
    pub expires_at: i64,
}

impl StreamingToken {
    /// Token for an environment with push disabled.
    pub fn disabled() -> Self {
        Self {
            push_enabled: false,
            token: String::new(),
            channels: Vec::new(),
            issued_at: 0,
            expires_at: 0,
        }
    }

    /// Seconds of validity left at issue time.
    pub fn lifetime_secs(&self) -> i64 {
        self.expires_at - self.issued_at
    }
}

/// JWT payload claims of the streaming token.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenClaims {
    pub iat: i64,
    pub exp: i64,
    /// JSON-encoded map of channel name to granted rights.
    #[serde(rename = "x-ably-capability", default)]
    pub capability: String,
}
