//! Server-sent-events streaming transport over reqwest.

use crate::error::SyncResult;
use crate::streaming::{RawStreamEvent, StreamingConnection, StreamingTransport};
use async_trait::async_trait;
use flagsync_api::{ApiConfig, ApiError, StreamingToken};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// SSE streaming transport.
///
/// The underlying HTTP client deliberately has no overall request timeout:
/// the event stream stays open for as long as the backend keeps publishing.
pub struct SseClient {
    client: reqwest::Client,
    config: ApiConfig,
}

impl SseClient {
    pub fn new(config: ApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build HTTP client");
        Self { client, config }
    }
}

#[async_trait]
impl StreamingTransport for SseClient {
    async fn connect(
        &self,
        token: &StreamingToken,
        channels: &[String],
    ) -> SyncResult<Box<dyn StreamingConnection>> {
        let url = format!(
            "{}?v=1.1&channels={}&accessToken={}",
            self.config.streaming_url,
            urlencoding::encode(&channels.join(",")),
            urlencoding::encode(&token.token),
        );
        debug!("opening streaming connection for {} channels", channels.len());

        let resp = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(ApiError::from)?
            .error_for_status()
            .map_err(ApiError::from)?;

        let stream = resp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec()));
        Ok(Box::new(SseConnection {
            stream: stream.boxed(),
            buffer: String::new(),
            pending: VecDeque::new(),
            opened: false,
            done: false,
        }))
    }
}

struct SseConnection {
    stream: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: String,
    pending: VecDeque<RawStreamEvent>,
    opened: bool,
    done: bool,
}

#[async_trait]
impl StreamingConnection for SseConnection {
    async fn next_event(&mut self) -> Option<RawStreamEvent> {
        if !self.opened {
            self.opened = true;
            return Some(RawStreamEvent::Opened);
        }

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.done {
                return None;
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                    self.drain_complete_frames();
                }
                Some(Err(e)) => {
                    debug!("stream read failed: {e}");
                    self.done = true;
                    return Some(RawStreamEvent::Error(None));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the byte stream closes the HTTP connection.
        self.done = true;
        self.pending.clear();
    }
}

impl SseConnection {
    fn drain_complete_frames(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(frame.trim_end_matches('\n')) {
                self.pending.push_back(event);
            }
        }
    }
}

/// Parses one complete SSE frame (the text between blank lines).
///
/// Returns `None` for comment-only frames (keepalives) and frame types the
/// engine does not consume.
fn parse_frame(frame: &str) -> Option<RawStreamEvent> {
    let mut event_type = "message";
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event_type = value,
            "data" => data_lines.push(value),
            // id and retry are irrelevant here.
            _ => {}
        }
    }

    let data = data_lines.join("\n");
    match event_type {
        "message" if !data.is_empty() => Some(RawStreamEvent::Message(data)),
        "message" => None,
        "error" => {
            let payload = if data.is_empty() { None } else { Some(data) };
            Some(RawStreamEvent::Error(payload))
        }
        other => {
            debug!("ignoring stream frame of type {other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn connection_from_chunks(chunks: Vec<&str>) -> SseConnection {
        let items: Vec<Result<Vec<u8>, reqwest::Error>> = chunks
            .into_iter()
            .map(|c| Ok(c.as_bytes().to_vec()))
            .collect();
        SseConnection {
            stream: futures::stream::iter(items).boxed(),
            buffer: String::new(),
            pending: VecDeque::new(),
            opened: false,
            done: false,
        }
    }

    #[test]
    fn parses_message_frame() {
        assert_eq!(
            parse_frame("id: 42\ndata: {\"channel\":\"c\"}"),
            Some(RawStreamEvent::Message("{\"channel\":\"c\"}".to_string()))
        );
    }

    #[test]
    fn parses_multi_line_data() {
        assert_eq!(
            parse_frame("data: line1\ndata: line2"),
            Some(RawStreamEvent::Message("line1\nline2".to_string()))
        );
    }

    #[test]
    fn parses_error_frame_with_payload() {
        assert_eq!(
            parse_frame("event: error\ndata: {\"code\":40142}"),
            Some(RawStreamEvent::Error(Some("{\"code\":40142}".to_string())))
        );
    }

    #[test]
    fn comment_only_frames_are_keepalives() {
        assert_eq!(parse_frame(": keepalive"), None);
        assert_eq!(parse_frame("id: 7"), None);
    }

    #[test]
    fn unknown_frame_types_are_ignored() {
        assert_eq!(parse_frame("event: sync\ndata: x"), None);
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let mut conn = connection_from_chunks(vec![
            "data: {\"a\"",
            ":1}\n\ndata: second\n",
            "\n",
        ]);

        assert_eq!(conn.next_event().await, Some(RawStreamEvent::Opened));
        assert_eq!(
            conn.next_event().await,
            Some(RawStreamEvent::Message("{\"a\":1}".to_string()))
        );
        assert_eq!(
            conn.next_event().await,
            Some(RawStreamEvent::Message("second".to_string()))
        );
        assert_eq!(conn.next_event().await, None);
    }

    #[tokio::test]
    async fn crlf_frames_parse_like_lf() {
        let mut conn = connection_from_chunks(vec!["event: error\r\ndata: boom\r\n\r\n"]);
        assert_eq!(conn.next_event().await, Some(RawStreamEvent::Opened));
        assert_eq!(
            conn.next_event().await,
            Some(RawStreamEvent::Error(Some("boom".to_string())))
        );
    }
}
