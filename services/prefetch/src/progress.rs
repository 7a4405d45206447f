//! Pull progress stream decoding.
//!
//! The daemon answers a pull with a stream of JSON messages, one per line:
//!
//! ```text
//! {"status":"Pulling from library/alpine","id":"latest"}
//! {"status":"Downloading","progressDetail":{"current":512,"total":3408},"id":"a0d0a0d46f8b"}
//! {"status":"Pull complete","progressDetail":{},"id":"a0d0a0d46f8b"}
//! ```
//!
//! [`ProgressDecoder`] turns the raw byte stream into [`ProgressEvent`]s.
//! Which events are worth a log line is decided separately by a
//! [`ProgressLog`] policy.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;

use crate::runtime::PullStream;

/// Byte counters attached to a transfer event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, deserialize_with = "null_as_default")]
    pub current: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total: u64,
}

/// Error reported by the daemon inside the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

/// One decoded message from a pull stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawProgressEvent")]
pub struct ProgressEvent {
    /// Layer ID (or tag for the leading "Pulling from" message).
    pub id: Option<String>,
    pub status: String,
    pub progress_detail: Option<ProgressDetail>,
    pub error: Option<String>,
    pub error_detail: Option<ErrorDetail>,
}

/// Wire shape of a message. Older daemons spell the layer key `ID`, and some
/// frames carry both spellings.
#[derive(Deserialize)]
struct RawProgressEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "ID")]
    legacy_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    status: String,
    #[serde(default, rename = "progressDetail")]
    progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

impl From<RawProgressEvent> for ProgressEvent {
    fn from(raw: RawProgressEvent) -> Self {
        Self {
            id: raw.id.or(raw.legacy_id),
            status: raw.status,
            progress_detail: raw.progress_detail,
            error: raw.error,
            error_detail: raw.error_detail,
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ProgressEvent {
    /// Layer ID, if present and non-empty.
    pub fn layer_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Error message if the daemon reported a failure in this frame.
    pub fn error_message(&self) -> Option<&str> {
        self.error_detail
            .as_ref()
            .map(|detail| detail.message.as_str())
            .filter(|message| !message.is_empty())
            .or(self.error.as_deref())
    }

    /// Returns true if this is a byte-level tick of an ongoing transfer.
    pub fn is_transfer_tick(&self) -> bool {
        self.progress_detail.is_some_and(|detail| detail.current > 0)
    }
}

/// Errors from decoding a pull stream.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("malformed progress message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to read pull stream: {0}")]
    Stream(#[from] io::Error),
}

/// Incremental decoder of a pull's progress stream.
///
/// Messages may be split across chunks or share one; whitespace between
/// them (including the daemon's `\r\n` delimiters) is skipped.
pub struct ProgressDecoder {
    stream: PullStream,
    buffer: BytesMut,
    pending: VecDeque<ProgressEvent>,
    finished: bool,
}

impl ProgressDecoder {
    /// Create a decoder that takes ownership of the stream.
    pub fn new(stream: PullStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Decode the next event.
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly. After an error
    /// the decoder should not be polled again.
    pub async fn next_event(&mut self) -> Result<Option<ProgressEvent>, ProgressError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            self.drain_buffer()?;
            if !self.pending.is_empty() {
                continue;
            }

            if self.finished {
                return self.finish();
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(ProgressError::Stream(e)),
                None => self.finished = true,
            }
        }
    }

    /// Consume the decoder as a lazy stream of events.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProgressEvent, ProgressError>> + Send {
        futures_util::stream::unfold(Some(self), |decoder| async move {
            let mut decoder = decoder?;
            match decoder.next_event().await {
                Ok(Some(event)) => Some((Ok(event), Some(decoder))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Move every complete message in the buffer to `pending`.
    fn drain_buffer(&mut self) -> Result<(), ProgressError> {
        let mut messages =
            serde_json::Deserializer::from_slice(&self.buffer).into_iter::<ProgressEvent>();
        let mut consumed = 0;

        let result = loop {
            match messages.next() {
                Some(Ok(event)) => {
                    self.pending.push_back(event);
                    consumed = messages.byte_offset();
                }
                // Incomplete trailing message; wait for more bytes.
                Some(Err(e)) if e.is_eof() => break Ok(()),
                // Events decoded before the bad message go out first; the
                // error resurfaces on the next drain.
                Some(Err(_)) if !self.pending.is_empty() => break Ok(()),
                Some(Err(e)) => break Err(ProgressError::Decode(e)),
                None => {
                    consumed = self.buffer.len();
                    break Ok(());
                }
            }
        };

        drop(messages);
        self.buffer.advance(consumed);
        result
    }

    /// End of stream: anything left in the buffer is a truncated message.
    fn finish(&mut self) -> Result<Option<ProgressEvent>, ProgressError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        match serde_json::from_slice::<ProgressEvent>(&self.buffer) {
            Err(e) => Err(ProgressError::Decode(e)),
            // drain_buffer would have consumed a complete message.
            Ok(event) => {
                self.buffer.clear();
                Ok(Some(event))
            }
        }
    }
}

/// Projection of progress events onto log lines.
pub trait ProgressLog: Send + Sync {
    /// The line to log for this event, or `None` to stay quiet.
    fn line(&self, event: &ProgressEvent) -> Option<String>;
}

/// Logs status changes and skips byte-level transfer ticks.
///
/// An event is logged when it has no progress detail or its current byte
/// count is zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipTransferTicks;

impl ProgressLog for SkipTransferTicks {
    fn line(&self, event: &ProgressEvent) -> Option<String> {
        if event.is_transfer_tick() {
            return None;
        }
        Some(status_line(event))
    }
}

/// Logs every event, with byte counters for transfer ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EveryEvent;

impl ProgressLog for EveryEvent {
    fn line(&self, event: &ProgressEvent) -> Option<String> {
        let line = status_line(event);
        match event.progress_detail {
            Some(detail) if detail.current > 0 => {
                Some(format!("{line} {}/{}", detail.current, detail.total))
            }
            _ => Some(line),
        }
    }
}

fn status_line(event: &ProgressEvent) -> String {
    match event.layer_id() {
        Some(id) => format!("{id}: {}", event.status),
        None => event.status.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stream_of(chunks: &[&'static str]) -> PullStream {
        let chunks: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Box::pin(futures_util::stream::iter(chunks))
    }

    async fn decode_all(chunks: &[&'static str]) -> Result<Vec<ProgressEvent>, ProgressError> {
        let mut decoder = ProgressDecoder::new(stream_of(chunks));
        let mut events = Vec::new();
        while let Some(event) = decoder.next_event().await? {
            events.push(event);
        }
        Ok(events)
    }

    fn event(id: Option<&str>, status: &str, detail: Option<(u64, u64)>) -> ProgressEvent {
        ProgressEvent {
            id: id.map(str::to_string),
            status: status.to_string(),
            progress_detail: detail.map(|(current, total)| ProgressDetail { current, total }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_decode_docker_lines() {
        let events = decode_all(&[
            "{\"status\":\"Pulling from library/alpine\",\"id\":\"latest\"}\r\n",
            "{\"status\":\"Pull complete\",\"progressDetail\":{},\"id\":\"a0d0\"}\r\n",
        ])
        .await
        .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].layer_id(), Some("latest"));
        assert_eq!(events[1].progress_detail, Some(ProgressDetail::default()));
    }

    #[tokio::test]
    async fn test_decode_message_split_across_chunks() {
        let events = decode_all(&["{\"stat", "us\":\"Downloading\",\"id\":\"la", "yer1\"}\n"])
            .await
            .unwrap();

        assert_eq!(events, vec![event(Some("layer1"), "Downloading", None)]);
    }

    #[tokio::test]
    async fn test_decode_several_messages_in_one_chunk() {
        let events = decode_all(&["{\"status\":\"a\"}\n{\"status\":\"b\"}{\"status\":\"c\"}"])
            .await
            .unwrap();

        let statuses: Vec<_> = events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_decode_empty_stream() {
        assert!(decode_all(&[]).await.unwrap().is_empty());
        assert!(decode_all(&["\r\n  \n"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_uppercase_id_alias() {
        let events = decode_all(&["{\"ID\":\"layer1\",\"status\":\"Waiting\"}"])
            .await
            .unwrap();
        assert_eq!(events[0].layer_id(), Some("layer1"));
    }

    #[tokio::test]
    async fn test_decode_both_id_spellings() {
        let events = decode_all(&["{\"id\":\"a\",\"ID\":\"b\",\"status\":\"Waiting\"}"])
            .await
            .unwrap();
        assert_eq!(events[0].layer_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_decode_null_fields() {
        let events = decode_all(&[
            "{\"status\":null,\"id\":\"x\"}\n",
            "{\"status\":\"Extracting\",\"progressDetail\":{\"current\":null,\"total\":null}}\n",
        ])
        .await
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, "");
        assert_eq!(events[0].layer_id(), Some("x"));
        assert_eq!(events[1].progress_detail, Some(ProgressDetail::default()));
        assert!(!events[1].is_transfer_tick());
    }

    #[tokio::test]
    async fn test_decode_malformed_frame() {
        let mut decoder = ProgressDecoder::new(stream_of(&[
            "{\"status\":\"ok\"}\n",
            "{\"status\": nope}\n",
            "{\"status\":\"never\"}\n",
        ]));

        assert_eq!(decoder.next_event().await.unwrap().unwrap().status, "ok");
        assert!(matches!(
            decoder.next_event().await,
            Err(ProgressError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_decode_truncated_frame() {
        let result = decode_all(&["{\"status\":\"ok\"}\n{\"status\":\"Down"]).await;
        assert!(matches!(result, Err(ProgressError::Decode(_))));
    }

    #[tokio::test]
    async fn test_decode_stream_error() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"status\":\"ok\"}\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut decoder = ProgressDecoder::new(Box::pin(futures_util::stream::iter(chunks)));

        assert!(decoder.next_event().await.unwrap().is_some());
        assert!(matches!(
            decoder.next_event().await,
            Err(ProgressError::Stream(_))
        ));
    }

    #[tokio::test]
    async fn test_into_stream_stops_after_error() {
        let decoder =
            ProgressDecoder::new(stream_of(&["{\"status\":\"a\"}\n]\n{\"status\":\"b\"}"]));
        let results: Vec<_> = decoder.into_stream().collect().await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_daemon_error_frame() {
        let events = decode_all(&[
            "{\"errorDetail\":{\"message\":\"manifest unknown\"},\"error\":\"manifest unknown\"}\n",
        ])
        .await
        .unwrap();
        assert_eq!(events[0].error_message(), Some("manifest unknown"));
    }

    #[test]
    fn test_skip_transfer_ticks() {
        let policy = SkipTransferTicks;

        assert_eq!(
            policy.line(&event(Some("layer1"), "Downloading", None)),
            Some("layer1: Downloading".to_string())
        );
        assert_eq!(policy.line(&event(Some("layer1"), "", Some((500, 1000)))), None);
        assert_eq!(
            policy.line(&event(Some("layer1"), "Pull complete", Some((0, 0)))),
            Some("layer1: Pull complete".to_string())
        );
        assert_eq!(
            policy.line(&event(Some(""), "Digest: sha256:abc", None)),
            Some("Digest: sha256:abc".to_string())
        );
    }

    #[test]
    fn test_every_event() {
        let policy = EveryEvent;

        assert_eq!(
            policy.line(&event(Some("layer1"), "Downloading", Some((500, 1000)))),
            Some("layer1: Downloading 500/1000".to_string())
        );
        assert_eq!(
            policy.line(&event(None, "Pulling", None)),
            Some("Pulling".to_string())
        );
    }
}
