//! Chat-completions wire format (format A)

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    SseFrame, StreamDecoder, StreamEncoder, WireCodec, WireFormat, image_source_from_url,
    part_type, required_str, text_parts, to_data_url,
};
use crate::error::{GatewayError, Result};
use crate::types::{
    CanonicalChatRequest, CanonicalChatResponse, CanonicalMessage, CanonicalStreamDelta,
    ContentPart, ImageSource, Role, StopReason, Usage,
};

/// Codec for the chat-completions schema
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletionsCodec;

// ── Wire types ──

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: Option<String>,
    messages: Option<Vec<ChatCompletionMessage>>,
    max_tokens: Option<u32>,
    max_completion_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    stop: Option<StopField>,
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Value>,
    #[serde(default)]
    function_call: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StopField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

// ── Mapping helpers ──

fn parse_role(role: &str) -> Result<Role> {
    match role {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" | "function" => Err(GatewayError::validation(format!(
            "messages with role '{}' are not supported",
            role
        ))),
        other => Err(GatewayError::validation(format!(
            "invalid message role '{}'",
            other
        ))),
    }
}

fn parse_content(content: Option<&Value>) -> Result<Vec<ContentPart>> {
    match content {
        Some(Value::String(text)) => Ok(vec![ContentPart::text(text.clone())]),
        Some(Value::Array(parts)) => parts.iter().map(parse_part).collect(),
        Some(Value::Null) | None => Err(GatewayError::validation("message content is required")),
        Some(_) => Err(GatewayError::validation(
            "message content must be a string or an array of parts",
        )),
    }
}

fn parse_part(part: &Value) -> Result<ContentPart> {
    match part_type(part) {
        "text" => Ok(ContentPart::text(required_str(part, "text", "text part")?)),
        "image_url" => {
            let url = match part.get("image_url") {
                Some(Value::String(url)) => url.as_str(),
                Some(obj) => required_str(obj, "url", "image_url part")?,
                None => {
                    return Err(GatewayError::validation("image_url part: missing 'image_url'"));
                }
            };
            Ok(ContentPart::Image {
                source: image_source_from_url(url),
            })
        }
        other => Err(GatewayError::validation(format!(
            "unsupported content part type '{}'",
            other
        ))),
    }
}

fn render_content(content: &[ContentPart]) -> Value {
    // Single text part collapses to a plain string for simple clients
    if let [ContentPart::Text { text }] = content {
        return Value::String(text.clone());
    }
    Value::Array(
        content
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { source } => {
                    let url = match source {
                        ImageSource::Url { url } => url.clone(),
                        ImageSource::Base64 { media_type, data } => to_data_url(media_type, data),
                    };
                    json!({"type": "image_url", "image_url": {"url": url}})
                }
            })
            .collect(),
    )
}

fn parse_finish_reason(reason: Option<&str>) -> Result<StopReason> {
    match reason {
        None | Some("stop") => Ok(StopReason::EndTurn),
        Some("length") => Ok(StopReason::MaxTokens),
        Some("content_filter") => Ok(StopReason::ContentFilter),
        Some(r @ ("tool_calls" | "function_call")) => Err(GatewayError::translation(format!(
            "finish_reason '{}' has no canonical form",
            r
        ))),
        Some(other) => Err(GatewayError::translation(format!(
            "unknown finish_reason '{}'",
            other
        ))),
    }
}

fn finish_reason(stop: StopReason) -> &'static str {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ContentFilter => "content_filter",
    }
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total(),
    })
}

fn has_value(v: &Option<Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

fn stream_error(payload: &Value) -> GatewayError {
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream reported an error mid-stream");
    GatewayError::UpstreamTransient {
        provider: String::new(),
        status: None,
        message: message.to_string(),
        timed_out: false,
    }
}

impl WireCodec for ChatCompletionsCodec {
    fn format(&self) -> WireFormat {
        WireFormat::ChatCompletions
    }

    fn request_to_canonical(&self, body: &Value) -> Result<CanonicalChatRequest> {
        let req = ChatCompletionRequest::deserialize(body)
            .map_err(|e| GatewayError::validation(format!("invalid request body: {}", e)))?;

        let model = req
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GatewayError::validation("missing required field: model"))?;
        let wire_messages = req
            .messages
            .filter(|m| !m.is_empty())
            .ok_or_else(|| GatewayError::validation("messages must be a non-empty array"))?;

        let mut messages = Vec::with_capacity(wire_messages.len());
        for msg in &wire_messages {
            if has_value(&msg.tool_calls) || has_value(&msg.function_call) {
                return Err(GatewayError::validation("tool calls are not supported"));
            }
            messages.push(CanonicalMessage {
                role: parse_role(&msg.role)?,
                content: parse_content(msg.content.as_ref())?,
            });
        }

        let stop = match req.stop {
            Some(StopField::One(s)) => vec![s],
            Some(StopField::Many(v)) => v,
            None => Vec::new(),
        };

        Ok(CanonicalChatRequest {
            model,
            messages,
            max_tokens: req.max_tokens.or(req.max_completion_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            stop,
            stream: req.stream.unwrap_or(false),
        })
    }

    fn request_from_canonical(&self, request: &CanonicalChatRequest) -> Result<Value> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": render_content(&m.content)}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }
        if request.stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        Ok(body)
    }

    fn response_to_canonical(&self, body: &Value) -> Result<CanonicalChatResponse> {
        let resp = ChatCompletionResponse::deserialize(body).map_err(|e| {
            GatewayError::translation(format!("unexpected chat completion shape: {}", e))
        })?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::translation("chat completion had no choices"))?;

        if has_value(&choice.message.tool_calls) {
            return Err(GatewayError::translation(
                "tool calls in responses have no canonical form",
            ));
        }

        let mut stop_reason = parse_finish_reason(choice.finish_reason.as_deref())?;
        let text = match (choice.message.content, choice.message.refusal) {
            (Some(text), _) => text,
            (None, Some(refusal)) => {
                stop_reason = StopReason::ContentFilter;
                refusal
            }
            (None, None) => String::new(),
        };
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };
        let usage = resp.usage.unwrap_or_default();

        Ok(CanonicalChatResponse {
            id: resp.id.unwrap_or_default(),
            model: resp.model.unwrap_or_default(),
            created: resp.created.unwrap_or(0),
            content,
            stop_reason,
            usage: Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }

    fn response_from_canonical(&self, response: &CanonicalChatResponse) -> Value {
        let text: String = text_parts(&response.content).collect();
        json!({
            "id": response.id,
            "object": "chat.completion",
            "created": response.created,
            "model": response.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": finish_reason(response.stop_reason),
            }],
            "usage": usage_json(&response.usage),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ChatCompletionsStreamDecoder::default())
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(ChatCompletionsStreamEncoder::default())
    }

    fn error_body(&self, error_type: &str, message: &str) -> Value {
        json!({"error": {"message": message, "type": error_type, "code": null}})
    }
}

// ── Streaming ──

/// Decodes `chat.completion.chunk` events ending with `data: [DONE]`
#[derive(Debug, Default)]
pub struct ChatCompletionsStreamDecoder {
    started: bool,
    finished: bool,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl ChatCompletionsStreamDecoder {
    fn start(&mut self, id: &str, model: &str, created: i64, out: &mut Vec<CanonicalStreamDelta>) {
        if !self.started {
            self.started = true;
            out.push(CanonicalStreamDelta::Start {
                id: id.to_string(),
                model: model.to_string(),
                created,
                role: Role::Assistant,
                usage: Usage::default(),
            });
        }
    }

    fn stop(&mut self, out: &mut Vec<CanonicalStreamDelta>) {
        self.start("", "", 0, out);
        self.finished = true;
        out.push(CanonicalStreamDelta::Stop {
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        });
    }
}

impl StreamDecoder for ChatCompletionsStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<CanonicalStreamDelta>> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(out);
        }
        if frame.data.trim() == "[DONE]" {
            self.stop(&mut out);
            return Ok(out);
        }

        let chunk: ChunkPayload = serde_json::from_str(&frame.data).map_err(|e| {
            GatewayError::translation(format!("unparseable chat completion chunk: {}", e))
        })?;
        if let Some(error) = &chunk.error {
            return Err(stream_error(error));
        }

        self.start(
            chunk.id.as_deref().unwrap_or_default(),
            chunk.model.as_deref().unwrap_or_default(),
            chunk.created.unwrap_or(0),
            &mut out,
        );

        if let Some(choice) = chunk.choices.into_iter().next() {
            if has_value(&choice.delta.tool_calls) {
                return Err(GatewayError::translation(
                    "streamed tool calls have no canonical form",
                ));
            }
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                out.push(CanonicalStreamDelta::Text { text });
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.stop_reason = Some(parse_finish_reason(Some(reason))?);
            }
        }
        if let Some(usage) = chunk.usage {
            self.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<CanonicalStreamDelta>> {
        let mut out = Vec::new();
        if self.finished {
            return Ok(out);
        }
        if self.stop_reason.is_some() {
            debug!("chat completion stream ended without [DONE]; closing on finish_reason");
            self.stop(&mut out);
            return Ok(out);
        }
        Err(GatewayError::UpstreamTransient {
            provider: String::new(),
            status: None,
            message: "stream ended before completion".to_string(),
            timed_out: false,
        })
    }
}

/// Encodes canonical deltas as chunks. The role is folded into the first
/// content chunk, so `Start` is held until text (or the stop) arrives.
#[derive(Debug, Default)]
pub struct ChatCompletionsStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_pending: bool,
    done: bool,
}

impl ChatCompletionsStreamEncoder {
    fn chunk(&self, delta: Value, finish: Option<&str>, usage: Option<&Usage>) -> SseFrame {
        let mut payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        });
        if let Some(usage) = usage {
            payload["usage"] = usage_json(usage);
        }
        SseFrame::data(payload.to_string())
    }

    fn take_role(&mut self) -> bool {
        std::mem::replace(&mut self.role_pending, false)
    }
}

impl StreamEncoder for ChatCompletionsStreamEncoder {
    fn encode(&mut self, delta: &CanonicalStreamDelta) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        match delta {
            CanonicalStreamDelta::Start {
                id, model, created, ..
            } => {
                self.id = id.clone();
                self.model = model.clone();
                self.created = *created;
                self.role_pending = true;
                Vec::new()
            }
            CanonicalStreamDelta::Text { text } => {
                let delta = if self.take_role() {
                    json!({"role": "assistant", "content": text})
                } else {
                    json!({"content": text})
                };
                vec![self.chunk(delta, None, None)]
            }
            CanonicalStreamDelta::Stop { stop_reason, usage } => {
                self.done = true;
                let mut frames = Vec::with_capacity(3);
                if self.take_role() {
                    frames.push(self.chunk(json!({"role": "assistant", "content": ""}), None, None));
                }
                frames.push(self.chunk(json!({}), Some(finish_reason(*stop_reason)), Some(usage)));
                frames.push(SseFrame::data("[DONE]"));
                frames
            }
        }
    }

    fn encode_error(&mut self, error_type: &str, message: &str) -> Vec<SseFrame> {
        self.done = true;
        vec![SseFrame::data(
            ChatCompletionsCodec.error_body(error_type, message).to_string(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_string_content_normalizes() {
        let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "Hi"}]});
        let req = ChatCompletionsCodec.request_to_canonical(&body).unwrap();
        assert_eq!(req.messages[0].content, vec![ContentPart::text("Hi")]);
        assert!(!req.stream);
        assert_eq!(req.max_tokens, None);
    }

    #[test]
    fn test_max_completion_tokens_alias() {
        let body = json!({
            "model": "gpt-4",
            "max_completion_tokens": 77,
            "messages": [{"role": "user", "content": "Hi"}]
        });
        let req = ChatCompletionsCodec.request_to_canonical(&body).unwrap();
        assert_eq!(req.max_tokens, Some(77));
    }

    #[test]
    fn test_missing_model_rejected() {
        let body = json!({"messages": [{"role": "user", "content": "Hi"}]});
        let err = ChatCompletionsCodec.request_to_canonical(&body).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_empty_messages_rejected() {
        let body = json!({"model": "gpt-4", "messages": []});
        assert!(ChatCompletionsCodec.request_to_canonical(&body).is_err());
    }

    #[test]
    fn test_tool_role_rejected() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "tool", "content": "42", "tool_call_id": "c1"}]
        });
        let err = ChatCompletionsCodec.request_to_canonical(&body).unwrap_err();
        assert!(err.to_string().contains("tool"));
    }

    #[test]
    fn test_unsupported_part_rejected() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": [{"type": "input_audio", "input_audio": {}}]}]
        });
        let err = ChatCompletionsCodec.request_to_canonical(&body).unwrap_err();
        assert!(err.to_string().contains("input_audio"));
    }

    #[test]
    fn test_single_text_part_collapses_to_string() {
        let req = CanonicalChatRequest {
            model: "gpt-4".into(),
            messages: vec![CanonicalMessage::text(Role::User, "Hi")],
            max_tokens: Some(10),
            temperature: None,
            top_p: None,
            stop: vec![],
            stream: false,
        };
        let body = ChatCompletionsCodec.request_from_canonical(&req).unwrap();
        assert_eq!(body["messages"][0]["content"], "Hi");
        assert_eq!(body["max_tokens"], 10);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_response_to_canonical() {
        let body = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
        });
        let resp = ChatCompletionsCodec.response_to_canonical(&body).unwrap();
        assert_eq!(resp.text(), "Hello!");
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
        assert_eq!(resp.usage.total(), 21);
        assert_eq!(resp.created, 1_700_000_000);
    }

    #[test]
    fn test_response_tool_calls_fail_translation() {
        let body = json!({
            "choices": [{
                "message": {"content": null, "tool_calls": [{"id": "c1", "type": "function"}]},
                "finish_reason": "tool_calls"
            }]
        });
        let err = ChatCompletionsCodec.response_to_canonical(&body).unwrap_err();
        assert!(matches!(err, GatewayError::Translation(_)));
    }

    #[test]
    fn test_response_without_choices_fails() {
        let err = ChatCompletionsCodec
            .response_to_canonical(&json!({"choices": []}))
            .unwrap_err();
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn test_response_from_canonical_shape() {
        let resp = CanonicalChatResponse {
            id: "r1".into(),
            model: "gpt-4".into(),
            created: 5,
            content: vec![ContentPart::text("Hi there")],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 2,
                output_tokens: 3,
            },
        };
        let body = ChatCompletionsCodec.response_from_canonical(&resp);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[test]
    fn test_stream_decoder_sequence() {
        let mut decoder = ChatCompletionsStreamDecoder::default();
        let frames = [
            r#"{"id":"c1","created":7,"model":"gpt-4","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
            r#"{"id":"c1","created":7,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"id":"c1","created":7,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            r#"{"id":"c1","created":7,"model":"gpt-4","choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#,
            "[DONE]",
        ];
        let mut deltas = Vec::new();
        for data in frames {
            deltas.extend(decoder.decode(&SseFrame::data(data)).unwrap());
        }
        assert!(decoder.finish().unwrap().is_empty());

        assert!(matches!(&deltas[0], CanonicalStreamDelta::Start { id, created: 7, .. } if id == "c1"));
        assert_eq!(deltas[1], CanonicalStreamDelta::Text { text: "Hel".into() });
        assert_eq!(deltas[2], CanonicalStreamDelta::Text { text: "lo".into() });
        assert_eq!(
            deltas[3],
            CanonicalStreamDelta::Stop {
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 4,
                    output_tokens: 2
                }
            }
        );
        assert_eq!(deltas.len(), 4);
    }

    #[test]
    fn test_stream_decoder_truncated_stream_errors() {
        let mut decoder = ChatCompletionsStreamDecoder::default();
        decoder
            .decode(&SseFrame::data(
                r#"{"id":"c1","choices":[{"delta":{"content":"partial"},"finish_reason":null}]}"#,
            ))
            .unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn test_stream_decoder_error_payload() {
        let mut decoder = ChatCompletionsStreamDecoder::default();
        let err = decoder
            .decode(&SseFrame::data(r#"{"error":{"message":"overloaded"}}"#))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_stream_encoder_folds_role_into_first_text() {
        let mut encoder = ChatCompletionsStreamEncoder::default();
        let start = CanonicalStreamDelta::Start {
            id: "c1".into(),
            model: "gpt-4".into(),
            created: 1,
            role: Role::Assistant,
            usage: Usage::default(),
        };
        assert!(encoder.encode(&start).is_empty());

        let first = encoder.encode(&CanonicalStreamDelta::Text { text: "A".into() });
        let first: Value = serde_json::from_str(&first[0].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "A");

        let second = encoder.encode(&CanonicalStreamDelta::Text { text: "B".into() });
        let second: Value = serde_json::from_str(&second[0].data).unwrap();
        assert!(second["choices"][0]["delta"].get("role").is_none());

        let stop = encoder.encode(&CanonicalStreamDelta::Stop {
            stop_reason: StopReason::MaxTokens,
            usage: Usage::default(),
        });
        assert_eq!(stop.len(), 2);
        let last_chunk: Value = serde_json::from_str(&stop[0].data).unwrap();
        assert_eq!(last_chunk["choices"][0]["finish_reason"], "length");
        assert_eq!(stop[1].data, "[DONE]");
    }

    #[test]
    fn test_stream_encoder_role_only_when_no_text() {
        let mut encoder = ChatCompletionsStreamEncoder::default();
        encoder.encode(&CanonicalStreamDelta::Start {
            id: "c1".into(),
            model: "m".into(),
            created: 0,
            role: Role::Assistant,
            usage: Usage::default(),
        });
        let frames = encoder.encode(&CanonicalStreamDelta::Stop {
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        });
        assert_eq!(frames.len(), 3);
        let role: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
    }
}
