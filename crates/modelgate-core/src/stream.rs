//! Stream relay: canonical deltas in, client-format frames out
//!
//! The relay pulls one delta at a time from the upstream, so frames leave
//! in exactly the order deltas arrived. Every way a relay can end (stop
//! signal, upstream error, deadline, shutdown, or the client dropping the
//! response) reports to its [`RelayObserver`] exactly once.

use std::collections::VecDeque;

use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::translate::{SseFrame, StreamEncoder, WireFormat};
use crate::types::{CanonicalStreamDelta, Usage};
use crate::upstream::DeltaStream;

/// How a relayed stream ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// The upstream sent its stop signal
    Completed(Usage),
    /// Upstream error, missing stop signal or deadline
    Failed(GatewayError),
    /// The client went away or the server is shutting down
    Cancelled { partial_output_tokens: u32 },
}

/// Receives the single outcome of a relay
pub trait RelayObserver: Send {
    fn finish(self: Box<Self>, outcome: RelayOutcome);
}

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Absolute cut-off for the whole stream
    pub deadline: Option<Instant>,
    /// Cancels the relay from outside (server shutdown)
    pub cancel: CancellationToken,
}

struct RelayState {
    upstream: DeltaStream,
    encoder: Box<dyn StreamEncoder>,
    pending: VecDeque<SseFrame>,
    observer: Option<Box<dyn RelayObserver>>,
    options: RelayOptions,
    done: bool,
    output_chars: usize,
}

enum Step {
    Next(Option<crate::error::Result<CanonicalStreamDelta>>),
    DeadlinePassed,
    Cancelled,
}

impl RelayState {
    fn settle(&mut self, outcome: RelayOutcome) {
        self.done = true;
        if let Some(observer) = self.observer.take() {
            observer.finish(outcome);
        }
    }

    fn fail(&mut self, err: GatewayError) {
        if matches!(err, GatewayError::Translation(_)) {
            error!("Dropping stream after translation failure: {}", err);
        } else {
            warn!("Stream failed mid-flight: {}", err);
        }
        let frames = self.encoder.encode_error(err.error_type(), &err.to_string());
        self.pending.extend(frames);
        self.settle(RelayOutcome::Failed(err));
    }

    fn partial_tokens(&self) -> u32 {
        u32::try_from(self.output_chars / 4).unwrap_or(u32::MAX)
    }
}

impl Drop for RelayState {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            debug!("Relay dropped before completion, client disconnected");
            observer.finish(RelayOutcome::Cancelled {
                partial_output_tokens: self.partial_tokens(),
            });
        }
    }
}

/// Relay `upstream` to a client speaking `target`
pub fn relay(
    upstream: DeltaStream,
    target: WireFormat,
    options: RelayOptions,
    observer: Box<dyn RelayObserver>,
) -> BoxStream<'static, SseFrame> {
    let state = RelayState {
        upstream,
        encoder: target.codec().stream_encoder(),
        pending: VecDeque::new(),
        observer: Some(observer),
        options,
        done: false,
        output_chars: 0,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                return Some((frame, st));
            }
            if st.done {
                return None;
            }

            let deadline = st.options.deadline;
            let cancel = st.options.cancel.clone();
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => Step::DeadlinePassed,
                item = st.upstream.next() => Step::Next(item),
            };

            match step {
                Step::Next(Some(Ok(delta))) => {
                    if let CanonicalStreamDelta::Text { text } = &delta {
                        st.output_chars += text.len();
                    }
                    let frames = st.encoder.encode(&delta);
                    st.pending.extend(frames);
                    if let CanonicalStreamDelta::Stop { usage, .. } = delta {
                        st.settle(RelayOutcome::Completed(usage));
                    }
                }
                Step::Next(Some(Err(err))) => st.fail(err),
                Step::Next(None) => st.fail(GatewayError::UpstreamTransient {
                    provider: String::new(),
                    status: None,
                    message: "stream ended without a stop signal".to_string(),
                    timed_out: false,
                }),
                Step::DeadlinePassed => st.fail(GatewayError::UpstreamTransient {
                    provider: String::new(),
                    status: None,
                    message: "request deadline exceeded".to_string(),
                    timed_out: true,
                }),
                Step::Cancelled => {
                    let partial_output_tokens = st.partial_tokens();
                    st.settle(RelayOutcome::Cancelled {
                        partial_output_tokens,
                    });
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, StopReason};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<RelayOutcome>>>);

    impl RelayObserver for Recorder {
        fn finish(self: Box<Self>, outcome: RelayOutcome) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    fn start() -> CanonicalStreamDelta {
        CanonicalStreamDelta::Start {
            id: "s1".into(),
            model: "m".into(),
            created: 1,
            role: Role::Assistant,
            usage: Usage::default(),
        }
    }

    fn text(t: &str) -> CanonicalStreamDelta {
        CanonicalStreamDelta::Text { text: t.into() }
    }

    fn stop() -> CanonicalStreamDelta {
        CanonicalStreamDelta::Stop {
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 3,
                output_tokens: 5,
            },
        }
    }

    fn upstream(items: Vec<crate::error::Result<CanonicalStreamDelta>>) -> DeltaStream {
        stream::iter(items).boxed()
    }

    fn five_chunks() -> Vec<crate::error::Result<CanonicalStreamDelta>> {
        let mut items = vec![Ok(start())];
        for t in ["one ", "two ", "three ", "four ", "five"] {
            items.push(Ok(text(t)));
        }
        items.push(Ok(stop()));
        items
    }

    #[tokio::test]
    async fn test_five_chunks_keep_order_chat_completions() {
        let recorder = Recorder::default();
        let frames: Vec<SseFrame> = relay(
            upstream(five_chunks()),
            WireFormat::ChatCompletions,
            RelayOptions::default(),
            Box::new(recorder.clone()),
        )
        .collect()
        .await;

        let (last, body) = frames.split_last().unwrap();
        assert_eq!(last.data, "[DONE]");
        let chunks: Vec<Value> = body
            .iter()
            .map(|f| serde_json::from_str(&f.data).unwrap())
            .collect();
        let joined: String = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(joined, "one two three four five");
        let final_chunk = chunks.last().unwrap();
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "stop");

        let outcomes = recorder.0.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RelayOutcome::Completed(u) if u.output_tokens == 5));
    }

    #[tokio::test]
    async fn test_five_chunks_keep_order_messages() {
        let frames: Vec<SseFrame> = relay(
            upstream(five_chunks()),
            WireFormat::Messages,
            RelayOptions::default(),
            Box::new(Recorder::default()),
        )
        .collect()
        .await;

        let texts: Vec<String> = frames
            .iter()
            .filter(|f| f.event.as_deref() == Some("content_block_delta"))
            .map(|f| {
                let v: Value = serde_json::from_str(&f.data).unwrap();
                v["delta"]["text"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(texts, vec!["one ", "two ", "three ", "four ", "five"]);
        assert_eq!(frames.last().unwrap().event.as_deref(), Some("message_stop"));
    }

    #[tokio::test]
    async fn test_upstream_error_becomes_error_frame() {
        let recorder = Recorder::default();
        let items = vec![
            Ok(start()),
            Ok(text("partial")),
            Err(GatewayError::UpstreamTransient {
                provider: "p".into(),
                status: Some(500),
                message: "boom".into(),
                timed_out: false,
            }),
            Ok(text("never")),
        ];
        let frames: Vec<SseFrame> = relay(
            upstream(items),
            WireFormat::Messages,
            RelayOptions::default(),
            Box::new(recorder.clone()),
        )
        .collect()
        .await;

        let last = frames.last().unwrap();
        assert_eq!(last.event.as_deref(), Some("error"));
        assert!(!frames.iter().any(|f| f.data.contains("never")));
        let outcomes = recorder.0.lock().unwrap();
        assert!(matches!(outcomes[0], RelayOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_missing_stop_is_failure() {
        let recorder = Recorder::default();
        let frames: Vec<SseFrame> = relay(
            upstream(vec![Ok(start()), Ok(text("cut"))]),
            WireFormat::ChatCompletions,
            RelayOptions::default(),
            Box::new(recorder.clone()),
        )
        .collect()
        .await;

        let last: Value = serde_json::from_str(&frames.last().unwrap().data).unwrap();
        assert!(last["error"]["message"].as_str().unwrap().contains("stop signal"));
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_client_drop_reports_cancel_once() {
        let recorder = Recorder::default();
        let mut s = relay(
            stream::iter(vec![Ok(start()), Ok(text("12345678"))])
                .chain(stream::pending())
                .boxed(),
            WireFormat::ChatCompletions,
            RelayOptions::default(),
            Box::new(recorder.clone()),
        );
        // Role is folded into the first text chunk
        let first = s.next().await.unwrap();
        assert!(first.data.contains("12345678"));
        drop(s);

        let outcomes = recorder.0.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0],
            RelayOutcome::Cancelled {
                partial_output_tokens: 2
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_stalled_stream() {
        let recorder = Recorder::default();
        let options = RelayOptions {
            deadline: Some(Instant::now() + Duration::from_secs(300)),
            cancel: CancellationToken::new(),
        };
        let frames: Vec<SseFrame> = relay(
            stream::iter(vec![Ok(start())]).chain(stream::pending()).boxed(),
            WireFormat::Messages,
            options,
            Box::new(recorder.clone()),
        )
        .collect()
        .await;

        let last: Value = serde_json::from_str(&frames.last().unwrap().data).unwrap();
        assert_eq!(last["error"]["type"], "timeout_error");
        assert!(matches!(
            recorder.0.lock().unwrap()[0],
            RelayOutcome::Failed(GatewayError::UpstreamTransient { timed_out: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_relay() {
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let frames: Vec<SseFrame> = relay(
            stream::pending().boxed(),
            WireFormat::ChatCompletions,
            RelayOptions {
                deadline: None,
                cancel,
            },
            Box::new(recorder.clone()),
        )
        .collect()
        .await;
        assert!(frames.is_empty());
        assert!(matches!(
            recorder.0.lock().unwrap()[0],
            RelayOutcome::Cancelled { .. }
        ));
    }
}
