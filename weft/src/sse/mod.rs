//! SSE pass-through pipe: forward upstream bytes untouched, capture a parsed
//! copy on the side.
//!
//! [`passthrough`] wraps an upstream byte stream and yields every chunk
//! downstream exactly as received; the pipe is poll-driven, so a slow client
//! naturally suspends the upstream read (back-pressure, no buffering). In
//! parallel each chunk feeds an event parser that scans `\n\n` boundaries,
//! decodes `data:` payloads as JSON, and accumulates the assistant content,
//! the ordered chunk list, and the last `usage` object. `[DONE]` sentinels
//! and malformed events are skipped; parser trouble never touches the
//! forwarded stream. When the upstream ends, the single `on_complete`
//! callback receives the [`SseCapture`].

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::Stream;
use serde_json::Value;

use crate::provider::ProviderError;

/// Parsed view of a completed SSE session.
#[derive(Debug, Default)]
pub struct SseCapture {
    /// Concatenation of every `choices[0].delta.content` string.
    pub content: String,
    /// Every parsed event payload, in arrival order (`[DONE]` excluded).
    pub chunks: Vec<Value>,
    /// Last non-null `usage` object seen.
    pub usage: Option<Value>,
    /// Arrival time of the first upstream chunk (TTFB for the trace).
    pub first_chunk_at: Option<Instant>,
}

/// Incremental SSE event parser. Bytes in, capture out; tolerant of chunk
/// splits anywhere, including mid-UTF-8 and mid-event.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    capture: SseCapture,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one upstream chunk and parses any events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.capture.first_chunk_at.is_none() {
            self.capture.first_chunk_at = Some(Instant::now());
        }
        self.buffer.extend_from_slice(chunk);
        while let Some((end, delim_len)) = find_event_boundary(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + delim_len).collect();
            self.parse_event(&event[..end]);
        }
    }

    /// Flushes a trailing event that arrived without its blank-line
    /// terminator, then returns the capture.
    pub fn finish(mut self) -> SseCapture {
        if !self.buffer.is_empty() {
            let event = std::mem::take(&mut self.buffer);
            self.parse_event(&event);
        }
        self.capture
    }

    fn parse_event(&mut self, event: &[u8]) {
        let Ok(text) = std::str::from_utf8(event) else {
            return;
        };
        let mut data = String::new();
        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        let Ok(payload) = serde_json::from_str::<Value>(&data) else {
            return;
        };
        if let Some(delta) = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            self.capture.content.push_str(delta);
        }
        if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
            self.capture.usage = Some(usage.clone());
        }
        self.capture.chunks.push(payload);
    }
}

/// Index and delimiter length of the first complete event boundary
/// (`\n\n` or `\r\n\r\n`), whichever comes first.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// The duplex transform returned by [`passthrough`].
pub struct PassThrough {
    upstream: BoxStream<'static, Result<Bytes, ProviderError>>,
    parser: Option<SseParser>,
    on_complete: Option<Box<dyn FnOnce(SseCapture) + Send>>,
    done: bool,
}

/// Wraps `upstream` so every chunk is forwarded verbatim while a capture is
/// assembled; `on_complete` fires exactly once when the upstream ends.
///
/// Dropping the returned stream mid-flight (client cancellation) drops the
/// upstream read and the parse buffer without invoking the callback.
pub fn passthrough(
    upstream: BoxStream<'static, Result<Bytes, ProviderError>>,
    on_complete: impl FnOnce(SseCapture) + Send + 'static,
) -> PassThrough {
    PassThrough {
        upstream,
        parser: Some(SseParser::new()),
        on_complete: Some(Box::new(on_complete)),
        done: false,
    }
}

impl Stream for PassThrough {
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.upstream.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(parser) = this.parser.as_mut() {
                    parser.feed(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                this.done = true;
                if let (Some(parser), Some(callback)) =
                    (this.parser.take(), this.on_complete.take())
                {
                    callback(parser.finish());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};

    fn upstream(chunks: Vec<&'static [u8]>) -> BoxStream<'static, Result<Bytes, ProviderError>> {
        Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    async fn run(
        chunks: Vec<&'static [u8]>,
    ) -> (Vec<u8>, SseCapture) {
        let captured: Arc<Mutex<Option<SseCapture>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let mut pipe = passthrough(upstream(chunks), move |capture| {
            *sink.lock().unwrap() = Some(capture);
        });
        let mut forwarded = Vec::new();
        while let Some(chunk) = pipe.next().await {
            forwarded.extend_from_slice(&chunk.unwrap());
        }
        let capture = captured.lock().unwrap().take().expect("on_complete fired");
        (forwarded, capture)
    }

    #[tokio::test]
    async fn bytes_pass_through_exactly_and_content_assembles() {
        let chunks: Vec<&[u8]> = vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            b"data: [DONE]\n\n",
        ];
        let expected: Vec<u8> = chunks.concat();
        let (forwarded, capture) = run(chunks).await;
        assert_eq!(forwarded, expected);
        assert_eq!(capture.content, "Hello");
        assert_eq!(capture.chunks.len(), 2);
        assert!(capture.first_chunk_at.is_some());
    }

    #[tokio::test]
    async fn events_split_across_chunks_reassemble() {
        let chunks: Vec<&[u8]> = vec![
            b"data: {\"choices\":[{\"del",
            b"ta\":{\"content\":\"Hi\"}}]}",
            b"\n\ndata: [DONE]\n\n",
        ];
        let (forwarded, capture) = run(chunks.clone()).await;
        assert_eq!(forwarded, chunks.concat());
        assert_eq!(capture.content, "Hi");
    }

    #[tokio::test]
    async fn malformed_events_are_forwarded_but_skipped() {
        let chunks: Vec<&[u8]> = vec![
            b"data: not-json\n\n",
            b": comment line\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        ];
        let (forwarded, capture) = run(chunks.clone()).await;
        assert_eq!(forwarded, chunks.concat());
        assert_eq!(capture.content, "ok");
        assert_eq!(capture.chunks.len(), 1);
    }

    #[tokio::test]
    async fn last_usage_wins_and_crlf_delimiters_parse() {
        let chunks: Vec<&[u8]> = vec![
            b"data: {\"choices\":[{\"delta\":{}}],\"usage\":null}\r\n\r\n",
            b"data: {\"choices\":[],\"usage\":{\"total_tokens\":7}}\r\n\r\n",
        ];
        let (_, capture) = run(chunks).await;
        assert_eq!(capture.usage.unwrap()["total_tokens"], 7);
    }

    #[tokio::test]
    async fn trailing_event_without_terminator_is_flushed() {
        let chunks: Vec<&[u8]> =
            vec![b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"];
        let (_, capture) = run(chunks).await;
        assert_eq!(capture.content, "tail");
    }

    #[tokio::test]
    async fn upstream_error_is_forwarded() {
        let stream: BoxStream<'static, Result<Bytes, ProviderError>> =
            Box::pin(futures_util::stream::iter(vec![
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
                Err(ProviderError::Transport("reset".into())),
            ]));
        let mut pipe = passthrough(stream, |_| {});
        assert!(pipe.next().await.unwrap().is_ok());
        assert!(pipe.next().await.unwrap().is_err());
    }
}
