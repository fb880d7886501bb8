//! # SSE Frame Decoder
//!
//! Splits a chunked response body into SSE frames:
//! - Raw bytes are buffered so a line split across reads is never decoded
//!   half-way (UTF-8 conversion happens per complete line)
//! - `\n` and `\r\n` line endings are accepted
//! - `event:`, `id:` and `data:` fields are collected until a blank line
//!   terminates the frame; multiple `data:` lines are joined with `\n`
//! - `:` comment lines and unknown fields are ignored
//! - Frames without any `data:` line are dropped

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::errors::TransportError;

/// One blank-line-terminated SSE frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` line.
    pub event: Option<String>,
    /// Value of the `id:` line.
    pub id: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

/// Incremental frame decoder with a byte carry-over buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            ..Self::default()
        }
    }

    /// Feed a chunk of body bytes and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(newline_pos);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            match std::str::from_utf8(&line_bytes) {
                Ok(line) => {
                    if let Some(frame) = self.process_line(line) {
                        frames.push(frame);
                    }
                }
                Err(e) => warn!(error = %e, "skipping non-UTF-8 SSE line"),
            }
        }
        frames
    }

    /// Flush at end of body: an unterminated trailing frame is still emitted.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            match std::str::from_utf8(&rest) {
                Ok(line) => {
                    let line = line.trim_end_matches('\r');
                    if let Some(frame) = self.process_line(line) {
                        return Some(frame);
                    }
                }
                Err(e) => warn!(error = %e, "skipping non-UTF-8 trailing SSE data"),
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event = Some(value.to_owned()),
            "id" => self.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, id, data })
    }
}

/// Decode a body byte stream into frames, in arrival order.
///
/// A body read error is yielded once and ends the stream.
pub fn parse_frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, TransportError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<TransportError> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(byte_stream), FrameDecoder::new(), VecDeque::new(), false),
        |(mut stream, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(frame) = ready.pop_front() {
                    return Some((Ok(frame), (stream, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        return Some((Err(e.into()), (stream, decoder, ready, true)));
                    }
                    None => {
                        done = true;
                        ready.extend(decoder.finish());
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            data: data.into(),
            ..SseFrame::default()
        }
    }

    #[test]
    fn single_frame() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"ping\"}\n\n");
        assert_eq!(frames, vec![frame("{\"type\":\"ping\"}")]);
    }

    #[test]
    fn event_and_id_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"event: message\nid: 42\ndata: {}\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].id.as_deref(), Some("42"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"con").is_empty());
        assert!(decoder.push(b"tent_delta\",\"delta\":\"x\"}\n").is_empty());
        let frames = decoder.push(b"\n");
        assert_eq!(frames[0].data, r#"{"type":"content_delta","delta":"x"}"#);
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let payload = "data: {\"delta\":\"成本\"}\n\n".as_bytes();
        // Split inside the first 3-byte character.
        let (a, b) = payload.split_at(17);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(a).is_empty());
        let frames = decoder.push(b);
        assert_eq!(frames[0].data, "{\"delta\":\"成本\"}");
    }

    #[test]
    fn crlf_line_endings() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(frames, vec![frame("a"), frame("b")]);
    }

    #[test]
    fn multiple_data_lines_join() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn comments_and_empty_frames_skipped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": keep-alive\n\nevent: noop\n\ndata:x\n\n");
        assert_eq!(frames, vec![frame("x")]);
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(frame("tail")));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn parse_frames_preserves_order() {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\ndata: ")),
            Ok(Bytes::from_static(b"2\n\n")),
            Ok(Bytes::from_static(b"data: 3")),
        ];
        let frames: Vec<_> = parse_frames(futures::stream::iter(chunks))
            .map(|f| f.unwrap().data)
            .collect()
            .await;
        assert_eq!(frames, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn parse_frames_yields_read_error_then_ends() {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err(TransportError::Aborted),
            Ok(Bytes::from_static(b"data: 2\n\n")),
        ];
        let items: Vec<_> = parse_frames(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].as_ref().is_err_and(TransportError::is_aborted));
    }
}
