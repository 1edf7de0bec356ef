//! Messages wire format (format B)

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    SseFrame, StreamDecoder, StreamEncoder, WireCodec, WireFormat, part_type, required_str,
    text_parts,
};
use crate::error::{GatewayError, Result};
use crate::types::{
    CanonicalChatRequest, CanonicalChatResponse, CanonicalMessage, CanonicalStreamDelta,
    ContentPart, ImageSource, Role, StopReason, Usage,
};

/// Providers speaking this format reject requests without `max_tokens`
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Codec for the messages schema
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagesCodec;

// ── Wire types ──

#[derive(Debug, Deserialize)]
struct MessagesRequest {
    model: Option<String>,
    messages: Option<Vec<WireMessage>>,
    system: Option<Value>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Vec<String>,
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ── Mapping helpers ──

fn parse_blocks(content: &Value, context: &str) -> Result<Vec<ContentPart>> {
    match content {
        Value::String(text) => Ok(vec![ContentPart::text(text.clone())]),
        Value::Array(blocks) => blocks.iter().map(parse_block).collect(),
        _ => Err(GatewayError::validation(format!(
            "{}: content must be a string or an array of blocks",
            context
        ))),
    }
}

fn parse_block(block: &Value) -> Result<ContentPart> {
    match part_type(block) {
        "text" => Ok(ContentPart::text(required_str(block, "text", "text block")?)),
        "image" => {
            let source = block
                .get("source")
                .ok_or_else(|| GatewayError::validation("image block: missing 'source'"))?;
            let source = match part_type(source) {
                "base64" => ImageSource::Base64 {
                    media_type: required_str(source, "media_type", "image source")?.to_string(),
                    data: required_str(source, "data", "image source")?.to_string(),
                },
                "url" => ImageSource::Url {
                    url: required_str(source, "url", "image source")?.to_string(),
                },
                other => {
                    return Err(GatewayError::validation(format!(
                        "unsupported image source type '{}'",
                        other
                    )));
                }
            };
            Ok(ContentPart::Image { source })
        }
        other => Err(GatewayError::validation(format!(
            "unsupported content block type '{}'",
            other
        ))),
    }
}

fn render_blocks(content: &[ContentPart]) -> Value {
    Value::Array(
        content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image {
                    source: ImageSource::Base64 { media_type, data },
                } => json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data},
                }),
                ContentPart::Image {
                    source: ImageSource::Url { url },
                } => json!({"type": "image", "source": {"type": "url", "url": url}}),
            })
            .collect(),
    )
}

fn parse_stop_reason(reason: Option<&str>) -> Result<StopReason> {
    match reason {
        None | Some("end_turn") => Ok(StopReason::EndTurn),
        Some("max_tokens") => Ok(StopReason::MaxTokens),
        Some("stop_sequence") => Ok(StopReason::StopSequence),
        Some("refusal") => Ok(StopReason::ContentFilter),
        Some("tool_use") => Err(GatewayError::translation(
            "stop_reason 'tool_use' has no canonical form",
        )),
        Some(other) => Err(GatewayError::translation(format!(
            "unknown stop_reason '{}'",
            other
        ))),
    }
}

fn stop_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ContentFilter => "refusal",
    }
}

fn upstream_error(data: &Value) -> GatewayError {
    let message = data
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("upstream reported an error mid-stream");
    GatewayError::UpstreamTransient {
        provider: String::new(),
        status: None,
        message: message.to_string(),
        timed_out: false,
    }
}

impl WireCodec for MessagesCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Messages
    }

    fn request_to_canonical(&self, body: &Value) -> Result<CanonicalChatRequest> {
        let req = MessagesRequest::deserialize(body)
            .map_err(|e| GatewayError::validation(format!("invalid request body: {}", e)))?;

        let model = req
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GatewayError::validation("missing required field: model"))?;
        let max_tokens = req
            .max_tokens
            .ok_or_else(|| GatewayError::validation("missing required field: max_tokens"))?;
        let wire_messages = req
            .messages
            .filter(|m| !m.is_empty())
            .ok_or_else(|| GatewayError::validation("messages must be a non-empty array"))?;
        if req.tools.as_ref().is_some_and(|t| !t.is_null()) {
            return Err(GatewayError::validation("tools are not supported"));
        }

        let mut messages = Vec::with_capacity(wire_messages.len() + 1);
        match &req.system {
            None | Some(Value::Null) => {}
            Some(system) => messages.push(CanonicalMessage {
                role: Role::System,
                content: parse_blocks(system, "system")?,
            }),
        }
        for msg in &wire_messages {
            let role = match msg.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(GatewayError::validation(format!(
                        "invalid message role '{}'",
                        other
                    )));
                }
            };
            messages.push(CanonicalMessage {
                role,
                content: parse_blocks(&msg.content, "message")?,
            });
        }

        Ok(CanonicalChatRequest {
            model,
            messages,
            max_tokens: Some(max_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            stop: req.stop_sequences,
            stream: req.stream.unwrap_or(false),
        })
    }

    fn request_from_canonical(&self, request: &CanonicalChatRequest) -> Result<Value> {
        // Leading system messages fold into the top-level field; anything
        // after the first turn has nowhere to go
        let leading = request
            .messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count();
        let (system, turns) = request.messages.split_at(leading);
        if turns.iter().any(|m| m.role == Role::System) {
            return Err(GatewayError::translation(
                "system messages after the first turn cannot be expressed in this format",
            ));
        }

        let messages: Vec<Value> = turns
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": render_blocks(&m.content)}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": request.stream,
        });
        if !system.is_empty() {
            if system
                .iter()
                .flat_map(|m| &m.content)
                .any(|part| part.as_text().is_none())
            {
                return Err(GatewayError::translation(
                    "system prompt in this format carries text only",
                ));
            }
            let text = system
                .iter()
                .map(CanonicalMessage::joined_text)
                .collect::<Vec<_>>()
                .join("\n\n");
            body["system"] = Value::String(text);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = json!(request.stop);
        }
        Ok(body)
    }

    fn response_to_canonical(&self, body: &Value) -> Result<CanonicalChatResponse> {
        let resp = MessagesResponse::deserialize(body)
            .map_err(|e| GatewayError::translation(format!("unexpected message shape: {}", e)))?;

        let mut text = String::new();
        for block in &resp.content {
            match part_type(block) {
                "text" => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
                other => {
                    return Err(GatewayError::translation(format!(
                        "response block '{}' has no canonical form",
                        other
                    )));
                }
            }
        }
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };

        Ok(CanonicalChatResponse {
            id: resp.id.unwrap_or_default(),
            model: resp.model.unwrap_or_default(),
            // Not part of this format
            created: 0,
            content,
            stop_reason: parse_stop_reason(resp.stop_reason.as_deref())?,
            usage: Usage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
            },
        })
    }

    fn response_from_canonical(&self, response: &CanonicalChatResponse) -> Value {
        let content: Vec<Value> = text_parts(&response.content)
            .map(|text| json!({"type": "text", "text": text}))
            .collect();
        json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": stop_reason(response.stop_reason),
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            },
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(MessagesStreamDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(MessagesStreamEncoder::default())
    }

    fn error_body(&self, error_type: &str, message: &str) -> Value {
        json!({"type": "error", "error": {"type": error_type, "message": message}})
    }
}

// ── Streaming ──

/// Decodes `message_start` .. `message_stop` event sequences
#[derive(Debug, Default)]
pub struct MessagesStreamDecoder {
    started: bool,
    finished: bool,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

impl MessagesStreamDecoder {
    fn ensure_started(&mut self, out: &mut Vec<CanonicalStreamDelta>) {
        if !self.started {
            self.started = true;
            out.push(CanonicalStreamDelta::Start {
                id: String::new(),
                model: String::new(),
                created: 0,
                role: Role::Assistant,
                usage: Usage::default(),
            });
        }
    }
}

impl StreamDecoder for MessagesStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<CanonicalStreamDelta>> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(out);
        }

        let data: Value = serde_json::from_str(&frame.data)
            .map_err(|e| GatewayError::translation(format!("unparseable stream event: {}", e)))?;
        // The `type` inside the payload is authoritative; `event:` mirrors it
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or_default();

        match kind {
            "message_start" => {
                let message = data.get("message").cloned().unwrap_or(Value::Null);
                self.input_tokens = message
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                    .unwrap_or(0);
                if !self.started {
                    self.started = true;
                    out.push(CanonicalStreamDelta::Start {
                        id: message
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        model: message
                            .get("model")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        created: 0,
                        role: Role::Assistant,
                        usage: Usage {
                            input_tokens: self.input_tokens,
                            output_tokens: 0,
                        },
                    });
                }
            }
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                match part_type(&block) {
                    "text" => {
                        self.ensure_started(&mut out);
                        if let Some(text) = block
                            .get("text")
                            .and_then(Value::as_str)
                            .filter(|t| !t.is_empty())
                        {
                            out.push(CanonicalStreamDelta::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    other => {
                        return Err(GatewayError::translation(format!(
                            "streamed block '{}' has no canonical form",
                            other
                        )));
                    }
                }
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                match part_type(&delta) {
                    "text_delta" => {
                        self.ensure_started(&mut out);
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        if !text.is_empty() {
                            out.push(CanonicalStreamDelta::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    other => {
                        return Err(GatewayError::translation(format!(
                            "streamed delta '{}' has no canonical form",
                            other
                        )));
                    }
                }
            }
            "message_delta" => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(tokens) = data.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    self.output_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
                }
            }
            "message_stop" => {
                self.ensure_started(&mut out);
                self.finished = true;
                out.push(CanonicalStreamDelta::Stop {
                    stop_reason: parse_stop_reason(self.stop_reason.as_deref())?,
                    usage: Usage {
                        input_tokens: self.input_tokens,
                        output_tokens: self.output_tokens,
                    },
                });
            }
            "ping" | "content_block_stop" => {}
            "error" => return Err(upstream_error(&data)),
            other => debug!("Ignoring unknown stream event '{}'", other),
        }

        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<CanonicalStreamDelta>> {
        if self.finished {
            return Ok(Vec::new());
        }
        Err(GatewayError::UpstreamTransient {
            provider: String::new(),
            status: None,
            message: "stream ended before message_stop".to_string(),
            timed_out: false,
        })
    }
}

/// Encodes canonical deltas as the messages event sequence
#[derive(Debug, Default)]
pub struct MessagesStreamEncoder {
    started: bool,
    block_open: bool,
    done: bool,
}

impl MessagesStreamEncoder {
    fn event(kind: &str, payload: Value) -> SseFrame {
        SseFrame::named(kind, payload.to_string())
    }

    fn message_start(id: &str, model: &str, usage: &Usage) -> SseFrame {
        Self::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": usage.input_tokens, "output_tokens": 0},
                },
            }),
        )
    }

    fn open_block(&mut self, frames: &mut Vec<SseFrame>) {
        if !self.block_open {
            self.block_open = true;
            frames.push(Self::event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""},
                }),
            ));
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if !self.started {
            self.started = true;
            frames.push(Self::message_start("", "", &Usage::default()));
        }
    }
}

impl StreamEncoder for MessagesStreamEncoder {
    fn encode(&mut self, delta: &CanonicalStreamDelta) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        match delta {
            CanonicalStreamDelta::Start {
                id, model, usage, ..
            } => {
                if !self.started {
                    self.started = true;
                    frames.push(Self::message_start(id, model, usage));
                }
            }
            CanonicalStreamDelta::Text { text } => {
                self.ensure_started(&mut frames);
                self.open_block(&mut frames);
                frames.push(Self::event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
            CanonicalStreamDelta::Stop {
                stop_reason: reason,
                usage,
            } => {
                self.ensure_started(&mut frames);
                self.done = true;
                if self.block_open {
                    frames.push(Self::event(
                        "content_block_stop",
                        json!({"type": "content_block_stop", "index": 0}),
                    ));
                }
                frames.push(Self::event(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason(*reason), "stop_sequence": null},
                        "usage": {"output_tokens": usage.output_tokens},
                    }),
                ));
                frames.push(Self::event("message_stop", json!({"type": "message_stop"})));
            }
        }
        frames
    }

    fn encode_error(&mut self, error_type: &str, message: &str) -> Vec<SseFrame> {
        self.done = true;
        vec![Self::event(
            "error",
            MessagesCodec.error_body(error_type, message),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(events: &[(&str, &str)]) -> Result<Vec<CanonicalStreamDelta>> {
        let mut decoder = MessagesStreamDecoder::default();
        let mut out = Vec::new();
        for (event, data) in events {
            out.extend(decoder.decode(&SseFrame::named(*event, *data))?);
        }
        out.extend(decoder.finish()?);
        Ok(out)
    }

    #[test]
    fn test_missing_max_tokens_rejected() {
        let body = json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": "Hi"}]
        });
        let err = MessagesCodec.request_to_canonical(&body).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn test_string_content_and_system_blocks() {
        let body = json!({
            "model": "claude-3",
            "max_tokens": 10,
            "system": [{"type": "text", "text": "rules"}],
            "messages": [{"role": "user", "content": "Hi"}]
        });
        let req = MessagesCodec.request_to_canonical(&body).unwrap();
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].joined_text(), "rules");
        assert_eq!(req.messages[1].content, vec![ContentPart::text("Hi")]);
    }

    #[test]
    fn test_tool_blocks_rejected() {
        let body = json!({
            "model": "claude-3",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1"}]}]
        });
        let err = MessagesCodec.request_to_canonical(&body).unwrap_err();
        assert!(err.to_string().contains("tool_result"));
    }

    #[test]
    fn test_multiple_leading_system_messages_are_joined() {
        let req = CanonicalChatRequest {
            model: "claude-3".into(),
            messages: vec![
                CanonicalMessage::text(Role::System, "one"),
                CanonicalMessage::text(Role::System, "two"),
                CanonicalMessage::text(Role::User, "Hi"),
            ],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: vec![],
            stream: false,
        };
        let body = MessagesCodec.request_from_canonical(&req).unwrap();
        assert_eq!(body["system"], "one\n\ntwo");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_mid_conversation_system_fails() {
        let req = CanonicalChatRequest {
            model: "claude-3".into(),
            messages: vec![
                CanonicalMessage::text(Role::User, "Hi"),
                CanonicalMessage::text(Role::System, "late"),
            ],
            max_tokens: Some(5),
            temperature: None,
            top_p: None,
            stop: vec![],
            stream: false,
        };
        let err = MessagesCodec.request_from_canonical(&req).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
    }

    #[test]
    fn test_image_in_system_prompt_fails() {
        let req = CanonicalChatRequest {
            model: "claude-3".into(),
            messages: vec![
                CanonicalMessage {
                    role: Role::System,
                    content: vec![
                        ContentPart::text("describe images like this one"),
                        ContentPart::Image {
                            source: ImageSource::Url {
                                url: "https://example.com/ref.png".into(),
                            },
                        },
                    ],
                },
                CanonicalMessage::text(Role::User, "Hi"),
            ],
            max_tokens: Some(5),
            temperature: None,
            top_p: None,
            stop: vec![],
            stream: false,
        };
        let err = MessagesCodec.request_from_canonical(&req).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
        assert!(err.to_string().contains("text only"));
    }

    #[test]
    fn test_response_to_canonical() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3",
            "content": [{"type": "text", "text": "Hel"}, {"type": "text", "text": "lo"}],
            "stop_reason": "stop_sequence",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        });
        let resp = MessagesCodec.response_to_canonical(&body).unwrap();
        assert_eq!(resp.text(), "Hello");
        assert_eq!(resp.stop_reason, StopReason::StopSequence);
        assert_eq!(resp.usage.total(), 7);
    }

    #[test]
    fn test_response_tool_use_fails_translation() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "f", "input": {}}],
            "stop_reason": "tool_use"
        });
        let err = MessagesCodec.response_to_canonical(&body).unwrap_err();
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn test_error_body_shape() {
        let body = MessagesCodec.error_body("invalid_request_error", "bad");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "bad");
    }

    #[test]
    fn test_stream_decoder_sequence() {
        let deltas = decode_all(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3","usage":{"input_tokens":11,"output_tokens":1}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            ("ping", r#"{"type":"ping"}"#),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            ),
            ("content_block_stop", r#"{"type":"content_block_stop","index":0}"#),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":3}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ])
        .unwrap();

        assert_eq!(deltas.len(), 3);
        assert!(matches!(&deltas[0], CanonicalStreamDelta::Start { id, .. } if id == "msg_1"));
        assert_eq!(deltas[1], CanonicalStreamDelta::Text { text: "Hi".into() });
        assert_eq!(
            deltas[2],
            CanonicalStreamDelta::Stop {
                stop_reason: StopReason::MaxTokens,
                usage: Usage {
                    input_tokens: 11,
                    output_tokens: 3
                }
            }
        );
    }

    #[test]
    fn test_stream_decoder_tool_delta_fails() {
        let err = decode_all(&[
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"m","model":"c"}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t"}}"#,
            ),
        ])
        .unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
    }

    #[test]
    fn test_stream_decoder_missing_stop_errors() {
        let err = decode_all(&[(
            "message_start",
            r#"{"type":"message_start","message":{"id":"m","model":"c"}}"#,
        )])
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stream_decoder_error_event() {
        let err = decode_all(&[(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )])
        .unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn test_stream_encoder_event_order() {
        let mut encoder = MessagesStreamEncoder::default();
        let mut frames = encoder.encode(&CanonicalStreamDelta::Start {
            id: "msg_1".into(),
            model: "claude-3".into(),
            created: 0,
            role: Role::Assistant,
            usage: Usage::default(),
        });
        frames.extend(encoder.encode(&CanonicalStreamDelta::Text { text: "a".into() }));
        frames.extend(encoder.encode(&CanonicalStreamDelta::Text { text: "b".into() }));
        frames.extend(encoder.encode(&CanonicalStreamDelta::Stop {
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 1,
                output_tokens: 2,
            },
        }));

        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            events,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let delta: Value = serde_json::from_str(&frames[5].data).unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["output_tokens"], 2);

        assert!(encoder.encode(&CanonicalStreamDelta::Text { text: "late".into() }).is_empty());
    }

    #[test]
    fn test_stream_encoder_error_frame() {
        let mut encoder = MessagesStreamEncoder::default();
        let frames = encoder.encode_error("upstream_error", "boom");
        assert_eq!(frames[0].event.as_deref(), Some("error"));
        let body: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(body["error"]["message"], "boom");
    }
}
