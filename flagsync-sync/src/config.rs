//! Sync engine configuration.

/// Whether the user has consented to event/impression submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserConsent {
    /// Tracking data may be submitted.
    #[default]
    Granted,
    /// Tracking data must not be submitted.
    Declined,
    /// Consent not yet decided; submission stays off until granted.
    Unknown,
}

impl UserConsent {
    pub fn is_granted(&self) -> bool {
        matches!(self, UserConsent::Granted)
    }
}

/// How segment memberships are kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// One global segments task fetching whole-segment diffs.
    #[default]
    SingleClient,
    /// One memberships task per attached user key.
    MultiClient,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between periodic feature flag fetches.
    pub features_refresh_secs: u64,
    /// Interval between periodic segment/membership fetches.
    pub segments_refresh_secs: u64,
    /// Whether to attempt push-based streaming at all.
    pub streaming_enabled: bool,
    /// Base delay for streaming reconnect/auth retry backoff.
    pub backoff_base_secs: u64,
    /// Cap for the exponential backoff delay.
    pub backoff_max_secs: u64,
    /// A connection that stays open this long resets the reconnect backoff.
    pub backoff_stability_secs: u64,
    /// How long before token expiry to reconnect with a fresh token.
    pub token_refresh_margin_secs: i64,
    /// Segment sync strategy.
    pub mode: SyncMode,
    /// Consent state gating the submitter subsystem.
    pub user_consent: UserConsent,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            features_refresh_secs: 30,
            segments_refresh_secs: 60,
            streaming_enabled: true,
            backoff_base_secs: 1,
            backoff_max_secs: 1800,
            backoff_stability_secs: 60,
            token_refresh_margin_secs: 600,
            mode: SyncMode::SingleClient,
            user_consent: UserConsent::Granted,
        }
    }
}
