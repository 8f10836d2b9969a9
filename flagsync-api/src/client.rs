//! HTTP client for the synchronization endpoints.
//!
//! Thin request/response wrapper: every method does one GET with bearer
//! auth and deserializes the body. Retry policy belongs to the callers —
//! the polling scheduler retries on its next interval, the push manager
//! through its backoff.

use crate::config::ApiConfig;
use crate::error::ApiResult;
use crate::types::{MembershipsResponse, SegmentChanges, SplitChanges};
use reqwest::Client;
use tracing::debug;

/// HTTP client for split, segment and membership fetches.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct FlagsApiClient {
    client: Client,
    config: ApiConfig,
}

impl FlagsApiClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self { client, config }
    }

    /// Fetches split definitions changed since the given change number.
    pub async fn split_changes(&self, since: i64) -> ApiResult<SplitChanges> {
        let url = format!("{}/splitChanges?since={}", self.config.sdk_url, since);
        debug!(since, "fetching split changes");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.sdk_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Fetches the key diff of one segment since the given change number.
    pub async fn segment_changes(&self, name: &str, since: i64) -> ApiResult<SegmentChanges> {
        let url = format!(
            "{}/segmentChanges/{}?since={}",
            self.config.sdk_url,
            urlencoding::encode(name),
            since
        );
        debug!(segment = name, since, "fetching segment changes");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.sdk_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Fetches the current segment memberships of one user key.
    pub async fn memberships(&self, key: &str) -> ApiResult<MembershipsResponse> {
        let url = format!("{}/memberships/{}", self.config.sdk_url, urlencoding::encode(key));
        debug!("fetching memberships");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.sdk_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
