//! Generic HTTP upstream for providers speaking either wire format

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt, stream};
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use super::{DeltaStream, UpstreamClient, UpstreamReply, attribute};
use crate::error::{GatewayError, Result};
use crate::translate::{self, SseDecoder, StreamDecoder, WireFormat};
use crate::types::{CanonicalChatRequest, CanonicalStreamDelta};

const MESSAGES_API_VERSION: &str = "2023-06-01";

/// How the credential travels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <secret>`
    #[default]
    Bearer,
    /// `x-api-key: <secret>`
    XApiKey,
}

pub struct HttpUpstream {
    provider_id: String,
    wire_format: WireFormat,
    base_url: String,
    auth: AuthScheme,
    timeout: Duration,
    client: Client,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("provider_id", &self.provider_id)
            .field("wire_format", &self.wire_format)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish()
    }
}

impl HttpUpstream {
    /// `timeout` bounds buffered calls; streams are bounded by the
    /// front-end's request deadline instead
    pub fn new(
        provider_id: impl Into<String>,
        wire_format: WireFormat,
        base_url: impl Into<String>,
        auth: AuthScheme,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            provider_id: provider_id.into(),
            wire_format,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            timeout,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.wire_format.endpoint_path())
    }

    fn network_error(&self, e: &reqwest::Error) -> GatewayError {
        GatewayError::UpstreamTransient {
            provider: self.provider_id.clone(),
            status: None,
            message: e.to_string(),
            timed_out: e.is_timeout(),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    async fn send_chat_request(
        &self,
        request: &CanonicalChatRequest,
        secret: &str,
    ) -> Result<UpstreamReply> {
        // Content this provider's format cannot carry is the client's problem
        let body = translate::from_canonical(request, self.wire_format).map_err(|e| match e {
            GatewayError::Translation(msg) => GatewayError::Validation(format!(
                "request cannot be sent to provider '{}': {}",
                self.provider_id, msg
            )),
            other => other,
        })?;

        debug!(
            "Upstream request: provider={}, format={}, model={}, messages={}, stream={}",
            self.provider_id,
            self.wire_format,
            request.model,
            request.messages.len(),
            request.stream
        );

        let mut builder = self.client.post(self.endpoint()).json(&body);
        builder = match self.auth {
            AuthScheme::Bearer => builder.bearer_auth(secret),
            AuthScheme::XApiKey => builder.header("x-api-key", secret),
        };
        if self.wire_format == WireFormat::Messages {
            builder = builder.header("anthropic-version", MESSAGES_API_VERSION);
        }
        if !request.stream {
            builder = builder.timeout(self.timeout);
        }

        let response = builder.send().await.map_err(|e| self.network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(
                &self.provider_id,
                status.as_u16(),
                &text,
                retry_after,
            ));
        }

        if request.stream {
            let decoder = self.wire_format.codec().stream_decoder();
            return Ok(UpstreamReply::Stream(delta_stream(
                self.provider_id.clone(),
                response.bytes_stream(),
                decoder,
            )));
        }

        let payload: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.network_error(&e)
            } else {
                GatewayError::translation(format!(
                    "provider '{}' returned an unparseable body: {}",
                    self.provider_id, e
                ))
            }
        })?;
        let mut canonical = translate::response_to_canonical(&payload, self.wire_format)
            .inspect_err(|e| error!("Provider '{}' response failed translation: {}", self.provider_id, e))?;
        if canonical.created == 0 {
            canonical.created = chrono::Utc::now().timestamp();
        }
        if canonical.id.is_empty() {
            canonical.id = format!("gen-{}", Uuid::new_v4().simple());
        }
        if canonical.model.is_empty() {
            canonical.model = request.model.clone();
        }
        Ok(UpstreamReply::Complete(canonical))
    }
}

/// Map a non-2xx provider response onto the error taxonomy
pub fn classify_status(
    provider_id: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let message = error_message(body);
    match status {
        429 => GatewayError::UpstreamRateLimited {
            provider: provider_id.to_string(),
            message,
            retry_after,
        },
        408 => GatewayError::UpstreamTransient {
            provider: provider_id.to_string(),
            status: Some(status),
            message,
            timed_out: true,
        },
        400..=499 => GatewayError::UpstreamPermanent {
            provider: provider_id.to_string(),
            status,
            message,
        },
        _ => GatewayError::UpstreamTransient {
            provider: provider_id.to_string(),
            status: Some(status),
            message,
            timed_out: status == 504,
        },
    }
}

/// Pull `error.message` out of either format's envelope, else the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(512).collect())
}

struct StreamState<S> {
    bytes: S,
    sse: SseDecoder,
    decoder: Box<dyn StreamDecoder>,
    pending: VecDeque<Result<CanonicalStreamDelta>>,
    finished: bool,
    provider_id: String,
}

impl<S> StreamState<S> {
    fn push_frames(&mut self, frames: Vec<translate::SseFrame>) {
        for frame in frames {
            match self.decoder.decode(&frame) {
                Ok(deltas) => self.pending.extend(deltas.into_iter().map(Ok)),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, e: GatewayError) {
        self.pending.push_back(Err(attribute(e, &self.provider_id)));
        self.finished = true;
    }

    fn patch_start(&self, delta: &mut CanonicalStreamDelta) {
        if let CanonicalStreamDelta::Start { id, created, .. } = delta {
            if *created == 0 {
                *created = chrono::Utc::now().timestamp();
            }
            if id.is_empty() {
                *id = format!("gen-{}", Uuid::new_v4().simple());
            }
        }
    }
}

/// Turn a provider's event-stream body into canonical deltas. The stream
/// ends after the first error.
pub fn delta_stream<S, B, E>(provider_id: String, bytes: S, decoder: Box<dyn StreamDecoder>) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = StreamState {
        bytes: Box::pin(bytes),
        sse: SseDecoder::new(),
        decoder,
        pending: VecDeque::new(),
        finished: false,
        provider_id,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                let mut item = item;
                if let Ok(delta) = item.as_mut() {
                    st.patch_start(delta);
                } else {
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => match st.sse.feed(chunk.as_ref()) {
                    Ok(frames) => st.push_frames(frames),
                    Err(e) => st.fail(e),
                },
                Some(Err(e)) => {
                    let err = GatewayError::UpstreamTransient {
                        provider: st.provider_id.clone(),
                        status: None,
                        message: format!("stream interrupted: {}", e),
                        timed_out: false,
                    };
                    st.fail(err);
                }
                None => {
                    if let Some(frame) = st.sse.finish() {
                        st.push_frames(vec![frame]);
                    }
                    if !st.finished {
                        match st.decoder.finish() {
                            Ok(deltas) => st.pending.extend(deltas.into_iter().map(Ok)),
                            Err(e) => st.fail(e),
                        }
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}
