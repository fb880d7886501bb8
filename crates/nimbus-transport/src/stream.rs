//! Frame-to-record pipeline.
//!
//! Turns decoded [`SseFrame`]s into [`Envelope`]s:
//! - Malformed payloads are logged and skipped, never fatal
//! - Heartbeats (`ping`/`pong`) are dropped here
//! - The stream ends right after the first terminal record, even if the
//!   socket stays open
//! - Cancellation yields [`TransportError::Aborted`] once and ends the stream

use std::pin::Pin;

use futures::{Stream, StreamExt};
use nimbus_core::Envelope;
use nimbus_core::text::truncate_str;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::errors::TransportError;
use crate::sse::SseFrame;

/// Boxed stream of records for one turn.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Envelope, TransportError>> + Send>>;

/// Build the record stream for one turn from a frame stream.
pub fn record_stream<S>(frames: S, cancel: CancellationToken) -> RecordStream
where
    S: Stream<Item = Result<SseFrame, TransportError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut frames = std::pin::pin!(frames);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = frames.next() => Some(next),
            };

            let Some(next) = next else {
                trace!("record stream aborted");
                yield Err(TransportError::Aborted);
                break;
            };

            let frame = match next {
                None => break,
                Some(Err(e)) => {
                    yield Err(e);
                    break;
                }
                Some(Ok(frame)) => frame,
            };

            let envelope = match Envelope::decode(&frame.data, frame.event, frame.id) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        error = %e,
                        data_preview = truncate_str(&frame.data, 100),
                        "skipping malformed record"
                    );
                    continue;
                }
            };

            if envelope.record.is_heartbeat() {
                trace!(tag = envelope.record.tag(), "heartbeat dropped");
                continue;
            }

            let terminal = envelope.record.is_terminal();
            yield Ok(envelope);
            if terminal {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use nimbus_core::Record;
    use nimbus_core::logging::capture_logs;

    use crate::sse::parse_frames;

    fn stream_of(body: &'static str, cancel: CancellationToken) -> RecordStream {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![Ok(Bytes::from_static(body.as_bytes()))];
        record_stream(parse_frames(futures::stream::iter(chunks)), cancel)
    }

    async fn tags(stream: RecordStream) -> Vec<String> {
        stream
            .map(|item| item.map(|env| env.record.tag().to_owned()).unwrap_or_else(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn drops_heartbeats_and_stops_at_terminal() {
        let body = concat!(
            "data: {\"type\":\"ping\"}\n\n",
            "data: {\"type\":\"content_delta\",\"delta\":\"a\"}\n\n",
            "data: {\"type\":\"complete\",\"success\":true}\n\n",
            "data: {\"type\":\"content_delta\",\"delta\":\"late\"}\n\n",
        );
        let tags = tags(stream_of(body, CancellationToken::new())).await;
        assert_eq!(tags, vec!["content_delta", "complete"]);
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_and_logged() {
        let (logs, _guard) = capture_logs();
        let body = concat!(
            "data: {not json\n\n",
            "data: {\"delta\":\"no type\"}\n\n",
            "data: {\"type\":\"chunk\",\"content\":\"ok\"}\n\n",
        );
        let tags = tags(stream_of(body, CancellationToken::new())).await;
        assert_eq!(tags, vec!["chunk"]);
        assert_eq!(logs.count_at_level(tracing::Level::WARN), 2);
        assert!(logs.has_event(tracing::Level::WARN, "skipping malformed record"));
    }

    #[tokio::test]
    async fn unknown_records_pass_through() {
        let body = "data: {\"type\":\"brand_new\"}\n\n";
        let mut stream = stream_of(body, CancellationToken::new());
        let envelope = stream.next().await.unwrap().unwrap();
        assert_matches!(envelope.record, Record::Unknown { ref tag } if tag == "brand_new");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_once() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = "data: {\"type\":\"chunk\",\"content\":\"x\"}\n\n";
        let items: Vec<_> = stream_of(body, cancel).collect().await;
        assert_eq!(items.len(), 1);
        assert_matches!(items[0], Err(TransportError::Aborted));
    }

    #[tokio::test]
    async fn event_line_does_not_override_type() {
        let body = "event: error\ndata: {\"type\":\"chunk\",\"content\":\"x\"}\n\n";
        let mut stream = stream_of(body, CancellationToken::new());
        let envelope = stream.next().await.unwrap().unwrap();
        assert_eq!(envelope.record.tag(), "chunk");
        assert_eq!(envelope.event.as_deref(), Some("error"));
    }
}
