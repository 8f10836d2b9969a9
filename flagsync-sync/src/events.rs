//! Events emitted by the push subsystem for the sync manager.

/// Feedback and update events flowing from the push manager to the manager
/// loop. Connection feedback drives the polling/streaming handover; update
/// events carry targeted changes decoded from stream notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// The stream is usable; polling can stop.
    Up,
    /// The stream is not usable; polling must cover.
    Down,
    /// The connection failed but will be retried with backoff.
    Retryable,
    /// Streaming is gone for the rest of the session.
    NonRetryable,
    /// The backend asked for a full reconnect; a full sync is required.
    Reset,
    /// Feature flags changed up to this change number.
    SplitsChanged { change_number: i64 },
    /// A flag was killed; apply locally, then catch up.
    SplitKilled {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },
    /// A segment changed up to this change number.
    SegmentChanged {
        change_number: i64,
        segment_name: String,
    },
    /// A single key's memberships changed. `segments` carries the full new
    /// set when the notification included a payload; `None` means re-fetch.
    MembershipsChanged {
        user_key: String,
        segments: Option<Vec<String>>,
        change_number: i64,
    },
    /// Every attached key must re-fetch its memberships.
    MembershipsUnbounded { change_number: i64 },
    /// Keys whose hash falls in the bitmap must re-fetch their memberships.
    MembershipsBounded {
        bitmap: Vec<u8>,
        change_number: i64,
    },
    /// Direct add/remove of one segment for keys listed by hash.
    MembershipsKeyList {
        segment_name: String,
        added: Vec<u64>,
        removed: Vec<u64>,
        change_number: i64,
    },
    /// A segment was dropped entirely; remove it from every key.
    MembershipsSegmentRemoved {
        segment_name: String,
        change_number: i64,
    },
}
