//! Protocol translation between client wire formats and the canonical model
//!
//! Each [`WireFormat`] resolves to a stateless [`WireCodec`] through a small
//! dispatch table. Codecs are pure: no I/O, no clocks, no retries. The only
//! state lives in the per-stream [`StreamDecoder`] / [`StreamEncoder`]
//! values, which hold just enough to produce the target framing order.
//!
//! Field mapping between the formats:
//!
//! | Canonical    | chat-completions (A)                  | messages (B)                          |
//! |--------------|---------------------------------------|---------------------------------------|
//! | text part    | string content or `{"type":"text"}`   | `{"type":"text"}`                     |
//! | image URL    | `{"type":"image_url"}`                | `{"type":"image","source":{"type":"url"}}` |
//! | image base64 | `image_url.url` as a `data:` URL      | `{"source":{"type":"base64"}}`        |
//! | system       | `system` / `developer` role message   | top-level `system`                    |
//! | max tokens   | `max_tokens` / `max_completion_tokens`| `max_tokens`                          |
//! | stop         | `stop`                                | `stop_sequences`                      |
//!
//! Tool calls, tool results, audio, documents and thinking blocks have no
//! canonical form and fail translation instead of being dropped.

pub mod chat_completions;
pub mod messages;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::types::{
    CanonicalChatRequest, CanonicalChatResponse, CanonicalStreamDelta, ContentPart, ImageSource,
};

pub use chat_completions::ChatCompletionsCodec;
pub use messages::MessagesCodec;
pub use sse::{SseDecoder, SseFrame};

/// A client- or provider-facing chat schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `POST /v1/chat/completions` style
    ChatCompletions,
    /// `POST /v1/messages` style
    Messages,
}

static CODECS: [&dyn WireCodec; 2] = [&ChatCompletionsCodec, &MessagesCodec];

impl WireFormat {
    pub fn codec(self) -> &'static dyn WireCodec {
        CODECS[self as usize]
    }

    /// Path of the chat endpoint relative to a provider's base URL
    pub fn endpoint_path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Messages => "/v1/messages",
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChatCompletions => write!(f, "chat_completions"),
            Self::Messages => write!(f, "messages"),
        }
    }
}

/// Converts one wire format to and from the canonical model
pub trait WireCodec: Send + Sync {
    fn format(&self) -> WireFormat;

    /// Parse and validate a client request body
    fn request_to_canonical(&self, body: &Value) -> Result<CanonicalChatRequest>;

    /// Render a canonical request as this format's request body
    fn request_from_canonical(&self, request: &CanonicalChatRequest) -> Result<Value>;

    /// Parse a provider's non-streamed response body
    fn response_to_canonical(&self, body: &Value) -> Result<CanonicalChatResponse>;

    /// Render a canonical response as this format's response body
    fn response_from_canonical(&self, response: &CanonicalChatResponse) -> Value;

    /// Fresh decoder for one upstream stream in this format
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Fresh encoder for one client stream in this format
    fn stream_encoder(&self) -> Box<dyn StreamEncoder>;

    /// This format's error envelope
    fn error_body(&self, error_type: &str, message: &str) -> Value;
}

/// Native stream events in, canonical deltas out
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<CanonicalStreamDelta>>;

    /// Called once the byte stream has ended
    fn finish(&mut self) -> Result<Vec<CanonicalStreamDelta>>;
}

/// Canonical deltas in, client frames out
pub trait StreamEncoder: Send {
    fn encode(&mut self, delta: &CanonicalStreamDelta) -> Vec<SseFrame>;

    fn encode_error(&mut self, error_type: &str, message: &str) -> Vec<SseFrame>;
}

/// Convert a client request body into canonical form
pub fn to_canonical(body: &Value, source: WireFormat) -> Result<CanonicalChatRequest> {
    source.codec().request_to_canonical(body)
}

/// Render a canonical request in the target format
pub fn from_canonical(request: &CanonicalChatRequest, target: WireFormat) -> Result<Value> {
    target.codec().request_from_canonical(request)
}

/// Render a canonical response in the target format
pub fn response_from_canonical(response: &CanonicalChatResponse, target: WireFormat) -> Value {
    target.codec().response_from_canonical(response)
}

/// Parse a provider response in its native format
pub fn response_to_canonical(body: &Value, source: WireFormat) -> Result<CanonicalChatResponse> {
    source.codec().response_to_canonical(body)
}

// ── Shared helpers ──

/// `data:<media_type>;base64,<data>` → parts
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

pub(crate) fn to_data_url(media_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", media_type, data)
}

pub(crate) fn image_source_from_url(url: &str) -> ImageSource {
    match parse_data_url(url) {
        Some((media_type, data)) => ImageSource::Base64 { media_type, data },
        None => ImageSource::Url {
            url: url.to_string(),
        },
    }
}

pub(crate) fn part_type(part: &Value) -> &str {
    part.get("type").and_then(Value::as_str).unwrap_or("<missing>")
}

pub(crate) fn required_str<'a>(value: &'a Value, field: &str, context: &str) -> Result<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation(format!("{}: missing string field '{}'", context, field)))
}

/// Canonical content is text-only on the response side
pub(crate) fn text_parts(content: &[ContentPart]) -> impl Iterator<Item = &str> {
    content.iter().filter_map(ContentPart::as_text)
}
