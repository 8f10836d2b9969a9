//! Streaming session authentication.
//!
//! The auth endpoint answers with a JWT whose payload carries the channel
//! grants (`x-ably-capability`) and the issue/expiry claims the push layer
//! uses to schedule its token refresh. Only the payload segment is decoded;
//! signature verification is the server's concern, the client just needs
//! the claims.

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::types::{AuthResponse, StreamingToken, TokenClaims};
use reqwest::Client;
use std::collections::HashMap;
use tracing::debug;

/// Client for the streaming auth endpoint.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    config: ApiConfig,
}

impl AuthClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self { client, config }
    }

    /// Authenticates a streaming session for the given user keys.
    ///
    /// An empty key list authenticates a server-side session (splits and
    /// segments channels only). Returns a disabled token when push is off
    /// for this environment.
    pub async fn authenticate(&self, user_keys: &[String]) -> ApiResult<StreamingToken> {
        let mut url = format!("{}/v2/auth?s=1.1", self.config.auth_url);
        for key in user_keys {
            url.push_str("&users=");
            url.push_str(&urlencoding::encode(key));
        }

        debug!(keys = user_keys.len(), "authenticating streaming session");
        let resp: AuthResponse = self
            .client
            .get(&url)
            .bearer_auth(&self.config.sdk_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.push_enabled {
            debug!("push disabled for this environment");
            return Ok(StreamingToken::disabled());
        }

        decode_streaming_token(&resp.token)
    }
}

/// Decodes the payload segment of the streaming JWT into a [`StreamingToken`].
pub fn decode_streaming_token(token: &str) -> ApiResult<StreamingToken> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ApiError::InvalidToken("missing payload segment".into()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ApiError::InvalidToken(format!("payload is not base64url: {e}")))?;

    let claims: TokenClaims = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::InvalidToken(format!("payload is not valid JSON: {e}")))?;

    let capability: HashMap<String, Vec<String>> = serde_json::from_str(&claims.capability)
        .map_err(|e| ApiError::InvalidToken(format!("capability is not valid JSON: {e}")))?;

    let mut channels: Vec<String> = capability.into_keys().collect();
    channels.sort();

    Ok(StreamingToken {
        push_enabled: true,
        token: token.to_string(),
        channels,
        issued_at: claims.iat,
        expires_at: claims.exp,
    })
}
