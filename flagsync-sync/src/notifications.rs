//! Stream notification decoding.
//!
//! The streaming channel delivers envelope messages whose `data` field is a
//! JSON-encoded string carrying the actual payload. This module decodes
//! envelopes into typed [`Notification`] values, including the compressed
//! membership payloads (gzip/zlib over base64), and owns the key-hashing
//! scheme used for channel naming and bounded-bitmap membership tests.

use serde::Deserialize;
use std::io::Read;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Control channels subscribe with this prefix to receive occupancy metrics.
pub const OCCUPANCY_PREFIX: &str = "[?occupancy=metrics.publishers]";

/// Per-key membership channels end with this suffix.
pub const MEMBERSHIPS_CHANNEL_SUFFIX: &str = "_memberships";

/// A decoded stream notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Feature flags changed up to this change number.
    SplitUpdate { change_number: i64 },
    /// A flag was killed.
    SplitKill {
        change_number: i64,
        split_name: String,
        default_treatment: String,
    },
    /// A segment changed.
    SegmentUpdate {
        change_number: i64,
        segment_name: String,
    },
    /// Legacy per-key membership update, routed by channel. `segments` is
    /// the full new set when the notification carried a payload.
    MembershipsUpdate {
        change_number: i64,
        segments: Option<Vec<String>>,
        channel: String,
    },
    /// Membership update addressing many keys at once.
    MembershipsUpdateV2 {
        change_number: i64,
        update: MembershipsV2Update,
    },
    /// Backend control signal on a control channel.
    Control {
        control_type: ControlType,
        channel: String,
        timestamp: i64,
    },
    /// Publisher presence metrics for a control channel.
    Occupancy {
        publishers: i64,
        channel: String,
        timestamp: i64,
    },
    /// The backend asks every client to drop and re-establish the stream.
    StreamingReset,
}

/// Decoded operation of a V2 membership notification.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipsV2Update {
    /// Every attached key must re-fetch its memberships.
    Unbounded,
    /// Keys whose hash tests positive against the bitmap must re-fetch.
    BoundedBitmap(Vec<u8>),
    /// Direct add/remove of one segment for the listed key hashes.
    KeyList {
        segment_name: String,
        added: Vec<u64>,
        removed: Vec<u64>,
    },
    /// The segment is gone; remove it from every key.
    SegmentRemoval { segment_name: String },
}

/// Control signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ControlType {
    #[serde(rename = "STREAMING_PAUSED")]
    StreamingPaused,
    #[serde(rename = "STREAMING_RESUMED")]
    StreamingResumed,
    #[serde(rename = "STREAMING_DISABLED")]
    StreamingDisabled,
}

// ── Wire formats ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    timestamp: i64,
    data: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WirePayload {
    SplitUpdate {
        #[serde(rename = "changeNumber")]
        change_number: i64,
    },
    SplitKill {
        #[serde(rename = "changeNumber")]
        change_number: i64,
        #[serde(rename = "splitName")]
        split_name: String,
        #[serde(rename = "defaultTreatment")]
        default_treatment: String,
    },
    SegmentUpdate {
        #[serde(rename = "changeNumber")]
        change_number: i64,
        #[serde(rename = "segmentName")]
        segment_name: String,
    },
    MySegmentsUpdate {
        #[serde(rename = "changeNumber")]
        change_number: i64,
        #[serde(rename = "includesPayload")]
        includes_payload: bool,
        #[serde(rename = "segmentList", default)]
        segment_list: Option<Vec<String>>,
    },
    MySegmentsUpdateV2 {
        #[serde(rename = "changeNumber")]
        change_number: i64,
        /// Compression: 0 = none, 1 = gzip, 2 = zlib.
        #[serde(default)]
        c: u8,
        /// Update type: 0 = unbounded, 1 = bounded bitmap, 2 = key list,
        /// 3 = segment removal.
        #[serde(default)]
        u: u8,
        /// Base64 payload, meaning depends on `u`.
        #[serde(default)]
        d: Option<String>,
        #[serde(rename = "segmentName", default)]
        segment_name: Option<String>,
    },
    Control {
        #[serde(rename = "controlType")]
        control_type: ControlType,
    },
    StreamingReset {},
}

/// Decodes one raw stream message into a notification.
///
/// Returns `None` for anything malformed or unrecognized; a bad message must
/// never take the stream down.
pub fn decode_message(raw: &str) -> Option<Notification> {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("dropping unparseable stream message: {e}");
            return None;
        }
    };

    let channel = strip_occupancy_prefix(&envelope.channel).to_string();

    if envelope.name.as_deref() == Some("[meta]occupancy") {
        #[derive(Deserialize)]
        struct Metrics {
            publishers: i64,
        }
        #[derive(Deserialize)]
        struct OccupancyData {
            metrics: Metrics,
        }

        let data: OccupancyData = match serde_json::from_str(&envelope.data) {
            Ok(data) => data,
            Err(e) => {
                debug!("dropping malformed occupancy message on {channel}: {e}");
                return None;
            }
        };
        return Some(Notification::Occupancy {
            publishers: data.metrics.publishers,
            channel,
            timestamp: envelope.timestamp,
        });
    }

    let payload: WirePayload = match serde_json::from_str(&envelope.data) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("dropping unrecognized notification on {channel}: {e}");
            return None;
        }
    };

    match payload {
        WirePayload::SplitUpdate { change_number } => {
            Some(Notification::SplitUpdate { change_number })
        }
        WirePayload::SplitKill {
            change_number,
            split_name,
            default_treatment,
        } => Some(Notification::SplitKill {
            change_number,
            split_name,
            default_treatment,
        }),
        WirePayload::SegmentUpdate {
            change_number,
            segment_name,
        } => Some(Notification::SegmentUpdate {
            change_number,
            segment_name,
        }),
        WirePayload::MySegmentsUpdate {
            change_number,
            includes_payload,
            segment_list,
        } => {
            let segments = if includes_payload {
                Some(segment_list.unwrap_or_default())
            } else {
                None
            };
            Some(Notification::MembershipsUpdate {
                change_number,
                segments,
                channel,
            })
        }
        WirePayload::MySegmentsUpdateV2 {
            change_number,
            c,
            u,
            d,
            segment_name,
        } => {
            let update = decode_v2_update(c, u, d.as_deref(), segment_name)?;
            Some(Notification::MembershipsUpdateV2 {
                change_number,
                update,
            })
        }
        WirePayload::Control { control_type } => Some(Notification::Control {
            control_type,
            channel,
            timestamp: envelope.timestamp,
        }),
        WirePayload::StreamingReset {} => Some(Notification::StreamingReset),
    }
}

fn decode_v2_update(
    compression: u8,
    update_type: u8,
    data: Option<&str>,
    segment_name: Option<String>,
) -> Option<MembershipsV2Update> {
    match update_type {
        0 => Some(MembershipsV2Update::Unbounded),
        1 => {
            let bitmap = decompress_payload(data?, compression)?;
            Some(MembershipsV2Update::BoundedBitmap(bitmap))
        }
        2 => {
            #[derive(Deserialize)]
            struct KeyListData {
                #[serde(default)]
                a: Vec<u64>,
                #[serde(default)]
                r: Vec<u64>,
            }

            let bytes = decompress_payload(data?, compression)?;
            let list: KeyListData = match serde_json::from_slice(&bytes) {
                Ok(list) => list,
                Err(e) => {
                    debug!("dropping key list with malformed payload: {e}");
                    return None;
                }
            };
            Some(MembershipsV2Update::KeyList {
                segment_name: segment_name?,
                added: list.a,
                removed: list.r,
            })
        }
        3 => Some(MembershipsV2Update::SegmentRemoval {
            segment_name: segment_name?,
        }),
        other => {
            debug!("dropping membership update with unknown update type {other}");
            None
        }
    }
}

fn decompress_payload(data: &str, compression: u8) -> Option<Vec<u8>> {
    use base64::{engine::general_purpose, Engine as _};

    let raw = match general_purpose::STANDARD.decode(data) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("dropping membership update with bad base64 payload: {e}");
            return None;
        }
    };

    let mut out = Vec::new();
    let result = match compression {
        0 => return Some(raw),
        1 => flate2::read::GzDecoder::new(&raw[..]).read_to_end(&mut out),
        2 => flate2::read::ZlibDecoder::new(&raw[..]).read_to_end(&mut out),
        other => {
            debug!("dropping membership update with unknown compression {other}");
            return None;
        }
    };

    match result {
        Ok(_) => Some(out),
        Err(e) => {
            debug!("dropping membership update with corrupt compressed payload: {e}");
            None
        }
    }
}

// ── Channel naming and key hashing ───────────────────────────────────────

/// Hashes a user key for channel naming and bitmap/key-list membership tests.
pub fn hash_key(user_key: &str) -> u64 {
    xxh3_64(user_key.as_bytes())
}

/// Lower-hex channel token for a user key.
pub fn channel_token(user_key: &str) -> String {
    format!("{:x}", hash_key(user_key))
}

/// Name of the per-key membership channel for a user key.
pub fn memberships_channel(user_key: &str) -> String {
    format!("{}{}", channel_token(user_key), MEMBERSHIPS_CHANNEL_SUFFIX)
}

/// Extracts the channel token from a membership channel name.
pub fn token_from_channel(channel: &str) -> Option<&str> {
    channel.strip_suffix(MEMBERSHIPS_CHANNEL_SUFFIX)
}

/// Adds the occupancy prefix to a channel name for subscription.
pub fn with_occupancy_prefix(channel: &str) -> String {
    format!("{OCCUPANCY_PREFIX}{channel}")
}

/// Removes the occupancy prefix from an incoming channel name, if present.
pub fn strip_occupancy_prefix(channel: &str) -> &str {
    channel.strip_prefix(OCCUPANCY_PREFIX).unwrap_or(channel)
}

/// Tests a key hash against a bounded-update bitmap.
pub fn bitmap_contains(bitmap: &[u8], key_hash: u64) -> bool {
    if bitmap.is_empty() {
        return false;
    }
    let index = (key_hash % (bitmap.len() as u64 * 8)) as usize;
    bitmap[index / 8] & (1 << (index % 8)) != 0
}
