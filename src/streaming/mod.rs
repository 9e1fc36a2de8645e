//! Streaming plumbing shared by every adapter and dialect
//!
//! Two pieces live here: an SSE event reader over a reqwest byte stream
//! (upstream side) and the bounded pump that moves normalized chunks from
//! the upstream reader to the client writer with backpressure and
//! cancellation.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{FinishReason, StreamChunk};

/// Bounded buffer between the upstream reader and the client writer.
/// When the client drains slowly the reader blocks on `send`, which in
/// turn stops reading the upstream socket: TCP backpressure end to end.
pub const STREAM_BUFFER_CHUNKS: usize = 32;

pub type ChunkStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

/// One server-sent event as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Decode an SSE byte stream into events. Handles events split across
/// byte chunks and multi-line `data:` fields; comment lines and unknown
/// fields are ignored per the SSE spec.
pub fn sse_events(
    response: reqwest::Response,
) -> impl Stream<Item = GatewayResult<SseEvent>> + Send {
    let mut bytes = response.bytes_stream();
    async_stream::try_stream! {
        let mut buffer = String::new();
        let mut event_name: Option<String> = None;
        let mut data_lines: Vec<String> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk
                .map_err(|e| GatewayError::UpstreamError(format!("stream read failed: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                if line.is_empty() {
                    if !data_lines.is_empty() {
                        yield SseEvent {
                            event: event_name.take(),
                            data: data_lines.join("\n"),
                        };
                        data_lines.clear();
                    } else {
                        event_name = None;
                    }
                } else if let Some(rest) = line.strip_prefix("event:") {
                    event_name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                }
            }
        }

        // Upstreams that close without a trailing blank line still get
        // their last event delivered.
        if !data_lines.is_empty() {
            yield SseEvent {
                event: event_name.take(),
                data: data_lines.join("\n"),
            };
        }
    }
}

/// Drive an upstream chunk stream through a bounded channel.
///
/// Guarantees on the output side:
/// - chunks arrive in upstream order,
/// - nothing is emitted after a terminal chunk,
/// - a mid-stream upstream failure appends exactly one synthetic
///   `finish_reason = "error"` chunk and closes,
/// - cancellation stops the reader promptly and drops the upstream body.
pub fn pump(upstream: ChunkStream, cancel: CancellationToken) -> ReceiverStream<StreamChunk> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut next_index: u32 = 0;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stream cancelled, dropping upstream body");
                    return;
                }
                item = upstream.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    let terminal = chunk.is_terminal();
                    next_index = chunk.index + 1;
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(chunk) => sent,
                    };
                    if sent.is_err() || terminal {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream failed mid-response");
                    let _ = tx
                        .send(StreamChunk::terminal(next_index, FinishReason::Error, None))
                        .await;
                    return;
                }
                None => {
                    // Upstream closed without a terminal chunk; treat like
                    // a failure so the client sees a definite end.
                    warn!("upstream stream ended without finish_reason");
                    let _ = tx
                        .send(StreamChunk::terminal(next_index, FinishReason::Error, None))
                        .await;
                    return;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenUsage;

    fn chunks_to_stream(chunks: Vec<GatewayResult<StreamChunk>>) -> ChunkStream {
        Box::pin(futures::stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_pump_preserves_order_and_terminates() {
        let upstream = chunks_to_stream(vec![
            Ok(StreamChunk::text(0, "hel")),
            Ok(StreamChunk::text(1, "lo")),
            Ok(StreamChunk::terminal(2, FinishReason::Stop, Some(TokenUsage::new(3, 2)))),
        ]);
        let out: Vec<StreamChunk> = pump(upstream, CancellationToken::new()).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].text_delta, "hel");
        assert_eq!(out[1].text_delta, "lo");
        assert_eq!(out[2].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_pump_stops_after_terminal_chunk() {
        // A misbehaving upstream keeps talking after the terminal chunk;
        // nothing after it may reach the client.
        let upstream = chunks_to_stream(vec![
            Ok(StreamChunk::terminal(0, FinishReason::Stop, None)),
            Ok(StreamChunk::text(1, "ghost")),
        ]);
        let out: Vec<StreamChunk> = pump(upstream, CancellationToken::new()).collect().await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_terminal());
    }

    #[tokio::test]
    async fn test_pump_synthesizes_error_chunk_on_failure() {
        let upstream = chunks_to_stream(vec![
            Ok(StreamChunk::text(0, "partial")),
            Err(GatewayError::UpstreamError("connection reset".into())),
        ]);
        let out: Vec<StreamChunk> = pump(upstream, CancellationToken::new()).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text_delta, "partial");
        assert_eq!(out[1].finish_reason, Some(FinishReason::Error));
    }

    #[tokio::test]
    async fn test_pump_synthesizes_error_on_truncated_stream() {
        let upstream = chunks_to_stream(vec![Ok(StreamChunk::text(0, "cut off"))]);
        let out: Vec<StreamChunk> = pump(upstream, CancellationToken::new()).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].finish_reason, Some(FinishReason::Error));
    }

    #[tokio::test]
    async fn test_pump_cancellation_stops_stream() {
        // An upstream that never ends.
        let upstream: ChunkStream = Box::pin(futures::stream::unfold(0u32, |i| async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Some((Ok(StreamChunk::text(i, "tick")), i + 1))
        }));
        let cancel = CancellationToken::new();
        let mut out = pump(upstream, cancel.clone());

        // Read a couple of chunks, then hang up.
        assert!(out.next().await.is_some());
        assert!(out.next().await.is_some());
        cancel.cancel();

        // The pump stops without a terminal chunk; at most one in-flight
        // chunk may still be buffered.
        let mut remaining = 0;
        while out.next().await.is_some() {
            remaining += 1;
            assert!(remaining <= super::STREAM_BUFFER_CHUNKS);
        }
    }

    #[tokio::test]
    async fn test_sse_events_parse_openai_framing() {
        let body = "data: {\"a\":1}\n\ndata: [DONE]\n\n";
        let events = collect_sse(body).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].event, None);
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn test_sse_events_parse_typed_events() {
        let body = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
                    event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";
        let events = collect_sse(body).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[1].event.as_deref(), Some("message_stop"));
    }

    #[tokio::test]
    async fn test_sse_events_handle_split_frames() {
        // Event boundary falls in the middle of a byte chunk.
        let events = collect_sse_chunks(&["data: {\"a\"", ":1}\n\nda", "ta: {\"b\":2}\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "{\"b\":2}");
    }

    async fn collect_sse(body: &str) -> Vec<SseEvent> {
        collect_sse_chunks(&[body]).await
    }

    async fn collect_sse_chunks(chunks: &[&str]) -> Vec<SseEvent> {
        // Round-trip through a real HTTP response so we exercise the same
        // reqwest surface the adapters use.
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};
        let server = MockServer::start().await;
        let body: String = chunks.concat();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        sse_events(response)
            .map(|e| e.unwrap())
            .collect::<Vec<_>>()
            .await
    }
}
