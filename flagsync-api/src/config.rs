//! Service layer configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the backend API clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// SDK key sent as a bearer token on every request.
    pub sdk_key: String,

    /// Base URL for split/segment/membership fetches.
    pub sdk_url: String,

    /// Base URL for streaming authentication.
    pub auth_url: String,

    /// Base URL for event/impression submission.
    pub events_url: String,

    /// Base URL of the streaming endpoint.
    pub streaming_url: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            ..Self::default()
        }
    }

    /// Creates a config pointing every endpoint at one local base URL.
    pub fn for_base_url(sdk_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            sdk_key: sdk_key.into(),
            sdk_url: base_url.clone(),
            auth_url: base_url.clone(),
            events_url: base_url.clone(),
            streaming_url: base_url,
            timeout_secs: 30,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            sdk_key: String::new(),
            sdk_url: "https://sdk.flagsync.io/api".to_string(),
            auth_url: "https://auth.flagsync.io/api".to_string(),
            events_url: "https://events.flagsync.io/api".to_string(),
            streaming_url: "https://streaming.flagsync.io/sse".to_string(),
            timeout_secs: 30,
        }
    }
}
