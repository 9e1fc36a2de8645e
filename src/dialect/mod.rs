//! Caller-facing wire dialects
//!
//! The incoming dialect is independent of the upstream dialect: a caller
//! posting OpenAI-shaped JSON gets OpenAI-shaped JSON back even when the
//! route lands on an Anthropic upstream. Each submodule owns one wire
//! shape: request parsing into the normalized types, response encoding,
//! stream re-encoding, and the error envelope.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use serde_json::Value;

use crate::error::GatewayError;
use crate::types::{ChatResponse, Dialect, StreamChunk};

/// Stateful re-encoder from normalized chunks to wire frames. A frame is
/// a complete unit of the dialect's streaming framing (an SSE event or a
/// JSON-array fragment); one chunk may produce several frames.
pub trait ChunkEncoder: Send {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String>;
    /// Frames emitted after the terminal chunk (terminators).
    fn finish(&mut self) -> Vec<String>;
    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

pub fn encode_response(dialect: Dialect, response: &ChatResponse) -> Value {
    match dialect {
        Dialect::OpenAi => openai::encode_response(response),
        Dialect::Anthropic => anthropic::encode_response(response),
        Dialect::Gemini => gemini::encode_response(response),
    }
}

pub fn encoder_for(dialect: Dialect, id: &str, model: &str) -> Box<dyn ChunkEncoder> {
    match dialect {
        Dialect::OpenAi => Box::new(openai::OpenAiChunkEncoder::new(id, model)),
        Dialect::Anthropic => Box::new(anthropic::AnthropicChunkEncoder::new(id, model)),
        Dialect::Gemini => Box::new(gemini::GeminiChunkEncoder::sse(model)),
    }
}

/// Dialect-shaped error envelope body.
pub fn error_body(dialect: Dialect, err: &GatewayError) -> Value {
    match dialect {
        Dialect::OpenAi => openai::error_body(err),
        Dialect::Anthropic => anthropic::error_body(err),
        Dialect::Gemini => gemini::error_body(err),
    }
}

pub(crate) fn sse_frame(data: &Value) -> String {
    format!("data: {}\n\n", data)
}

pub(crate) fn sse_event_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}
