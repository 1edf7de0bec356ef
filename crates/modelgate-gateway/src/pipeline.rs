//! Request state machine for the chat endpoints
//!
//! ```text
//! Received → Validated → KeySelected → RateLimitReserved → UpstreamDispatched
//!            ↑                                                 │
//!            └────── retryable failure, next candidate ────────┤
//!                                                              ↓
//!                              StreamingRelay | BufferedResponse → Completed | Failed
//! ```
//!
//! Accounting happens once per attempt: the reservation is either
//! committed or rolled back, and the key and provider hear about the
//! result exactly once. For streams that happens when the relay ends.
//! Running out of the request budget is not charged to anyone.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use modelgate_core::translate::{response_from_canonical, to_canonical};
use modelgate_core::{
    Admission, CanonicalChatRequest, GatewayError, HealthTracker, KeyManager, RelayObserver, RelayOptions,
    RelayOutcome, Reservation, Result, RouteConstraints, Scope, SseFrame, UpstreamClient,
    UpstreamReply, Units, WireFormat, relay,
};

use crate::protocol::ApiError;
use crate::server::GatewayState;

/// Completion size assumed for reservations when the client sets no limit
const UNSPECIFIED_COMPLETION_ESTIMATE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validated,
    KeySelected,
    RateLimitReserved,
    UpstreamDispatched,
    StreamingRelay,
    BufferedResponse,
    Completed,
    Failed,
}

/// One inbound request moving through [`RequestState`]s
struct RequestRun {
    id: String,
    format: WireFormat,
    state: RequestState,
}

impl RequestRun {
    fn new(format: WireFormat) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        debug!("[{}] {:?} on {} endpoint", &id[..8], RequestState::Received, format);
        Self {
            id,
            format,
            state: RequestState::Received,
        }
    }

    fn tag(&self) -> &str {
        &self.id[..8]
    }

    fn advance(&mut self, next: RequestState) {
        debug!("[{}] {:?} -> {:?}", self.tag(), self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: GatewayError) -> Response {
        self.advance(RequestState::Failed);
        if error.status_code() >= 500 {
            warn!("[{}] request failed: {}", self.tag(), error);
        } else {
            debug!("[{}] request rejected: {}", self.tag(), error);
        }
        ApiError::new(self.format, error).into_response()
    }
}

/// Serve one chat request arriving in `format`
pub async fn handle_chat(state: GatewayState, format: WireFormat, body: Bytes) -> Response {
    let mut run = RequestRun::new(format);

    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return run.fail(GatewayError::validation(format!("invalid JSON body: {}", e)));
        }
    };
    let request = match to_canonical(&value, format) {
        Ok(r) => r,
        // Content the client sent that has no canonical form
        Err(GatewayError::Translation(msg)) => return run.fail(GatewayError::Validation(msg)),
        Err(e) => return run.fail(e),
    };
    run.advance(RequestState::Validated);

    match dispatch(&state, &mut run, request).await {
        Ok(response) => response,
        Err(e) => run.fail(e),
    }
}

fn reservation_units(request: &CanonicalChatRequest) -> Units {
    let completion = request
        .max_tokens
        .map(u64::from)
        .unwrap_or(UNSPECIFIED_COMPLETION_ESTIMATE);
    Units::request(u64::from(request.estimated_prompt_tokens()) + completion)
}

async fn dispatch(
    state: &GatewayState,
    run: &mut RequestRun,
    request: CanonicalChatRequest,
) -> Result<Response> {
    let settings = &state.settings;
    let units = reservation_units(&request);
    let constraints = RouteConstraints {
        model: request.model.clone(),
        stream: request.stream,
        units,
    };
    let candidates = state.router.select_providers(&constraints, settings.strategy)?;
    let deadline = Instant::now() + settings.request_timeout;

    let mut attempts = 0;
    let mut last_error = None;
    for candidate in candidates {
        if attempts >= settings.max_attempts {
            debug!("[{}] attempt cap of {} reached", run.tag(), settings.max_attempts);
            break;
        }
        let provider_id = candidate.provider.id.as_str();
        if Instant::now() >= deadline {
            debug!("[{}] request budget spent before trying '{}'", run.tag(), provider_id);
            return Err(deadline_exceeded(provider_id));
        }
        // Dropping the admission on any exit below hands a probe back
        let Some(admission) = state.health.admit(provider_id) else {
            debug!("[{}] provider '{}' not admitted", run.tag(), provider_id);
            continue;
        };
        let Some(client) = state.upstreams.get(provider_id) else {
            warn!("No upstream client registered for provider '{}'", provider_id);
            continue;
        };

        let key = state.keys.select_key_for(provider_id, units).await?;
        run.advance(RequestState::KeySelected);

        let scopes = vec![
            Scope::provider(provider_id),
            Scope::key(provider_id, key.id.as_str()),
        ];
        let reservation = state.limiter.reserve(scopes, units)?;
        run.advance(RequestState::RateLimitReserved);

        attempts += 1;
        let mut upstream_request = request.clone();
        upstream_request.model = candidate.upstream_model.clone();
        run.advance(RequestState::UpstreamDispatched);
        debug!(
            "[{}] attempt {} via '{}' as '{}' with key {}",
            run.tag(),
            attempts,
            provider_id,
            upstream_request.model,
            key.prefix
        );

        let started = Instant::now();
        let outcome = call_upstream(client.as_ref(), &upstream_request, &key.secret, deadline).await;
        let latency = started.elapsed();

        match outcome {
            Ok(UpstreamReply::Complete(response)) => {
                state.health.record_success(provider_id, latency);
                let tokens = u64::from(response.usage.total());
                reservation.commit(tokens);
                if let Err(e) = state.keys.record_success(&key.id, tokens).await {
                    warn!("Failed to record usage for key {}: {}", key.prefix, e);
                }
                run.advance(RequestState::BufferedResponse);
                let body = response_from_canonical(&response, run.format);
                run.advance(RequestState::Completed);
                info!(
                    "[{}] {} served by '{}' in {:?} ({} tokens)",
                    run.tag(),
                    request.model,
                    provider_id,
                    latency,
                    tokens
                );
                return Ok((StatusCode::OK, Json(body)).into_response());
            }
            Ok(UpstreamReply::Stream(deltas)) => {
                // Health hears about the stream once, when the relay ends
                run.advance(RequestState::StreamingRelay);
                let observer = StreamAccounting {
                    tag: run.tag().to_string(),
                    admission,
                    key_id: key.id.clone(),
                    key_prefix: key.prefix.clone(),
                    keys: Arc::clone(&state.keys),
                    health: Arc::clone(&state.health),
                    reservation,
                    first_event_latency: latency,
                    deadline,
                };
                let options = RelayOptions {
                    deadline: Some(deadline),
                    cancel: state.shutdown.child_token(),
                };
                let frames = relay(deltas, run.format, options, Box::new(observer));
                info!(
                    "[{}] streaming {} from '{}' (first event after {:?})",
                    run.tag(),
                    request.model,
                    provider_id,
                    latency
                );
                return Ok(sse_response(frames));
            }
            Err(err) if budget_spent(&err, deadline) => {
                reservation.rollback();
                warn!(
                    "[{}] request budget ran out waiting on '{}' after {:?}",
                    run.tag(),
                    provider_id,
                    latency
                );
                return Err(err);
            }
            Err(err) => {
                reservation.rollback();
                warn!(
                    "[{}] provider '{}' failed after {:?}: {}",
                    run.tag(),
                    provider_id,
                    latency,
                    err
                );
                settle_failure(state, admission, &key.id, &err, Some(latency)).await;
                if !err.is_retryable() {
                    return Err(err);
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or(GatewayError::AllProvidersExhausted {
        model: request.model.clone(),
    }))
}

/// Send the request, and for streams wait for the first delta so that a
/// provider failing before any output can still be swapped out
async fn call_upstream(
    client: &dyn UpstreamClient,
    request: &CanonicalChatRequest,
    secret: &str,
    deadline: Instant,
) -> Result<UpstreamReply> {
    let provider = client.provider_id();
    let reply = tokio::time::timeout_at(deadline, client.send_chat_request(request, secret))
        .await
        .map_err(|_| deadline_exceeded(provider))??;

    match reply {
        UpstreamReply::Stream(mut deltas) => {
            let first = tokio::time::timeout_at(deadline, deltas.next())
                .await
                .map_err(|_| deadline_exceeded(provider))?;
            match first {
                Some(Ok(delta)) => Ok(UpstreamReply::Stream(
                    stream::iter([Ok(delta)]).chain(deltas).boxed(),
                )),
                Some(Err(e)) => Err(e),
                None => Err(GatewayError::UpstreamTransient {
                    provider: provider.to_string(),
                    status: None,
                    message: "stream closed before the first event".to_string(),
                    timed_out: false,
                }),
            }
        }
        complete => Ok(complete),
    }
}

/// A timeout that came from the request's own budget rather than the provider
fn budget_spent(err: &GatewayError, deadline: Instant) -> bool {
    matches!(err, GatewayError::UpstreamTransient { timed_out: true, .. }) && Instant::now() >= deadline
}

fn deadline_exceeded(provider: &str) -> GatewayError {
    GatewayError::UpstreamTransient {
        provider: provider.to_string(),
        status: None,
        message: "request deadline exceeded".to_string(),
        timed_out: true,
    }
}

/// Charge a failed call to the provider's health and the key's standing
async fn settle_failure(
    state: &GatewayState,
    admission: Admission,
    key_id: &str,
    err: &GatewayError,
    latency: Option<Duration>,
) {
    if err.counts_against_provider() {
        state.health.record_failure(admission.provider_id(), latency);
    }
    drop(admission);
    if let Some(kind) = err.failure_kind() {
        if let Err(e) = state.keys.record_failure(key_id, kind).await {
            warn!("Failed to record key failure: {}", e);
        }
    }
}

fn sse_response(frames: BoxStream<'static, SseFrame>) -> Response {
    let events = frames.map(|frame| {
        let event = Event::default().data(frame.data);
        Ok::<_, Infallible>(match frame.event {
            Some(name) => event.event(name),
            None => event,
        })
    });
    Sse::new(events).into_response()
}

// ── Stream accounting ──

/// Settles a streamed attempt once the relay ends, however it ends. Owns
/// the provider admission, so a half-open probe stays claimed until then.
struct StreamAccounting {
    tag: String,
    admission: Admission,
    key_id: String,
    key_prefix: String,
    keys: Arc<KeyManager>,
    health: Arc<HealthTracker>,
    reservation: Reservation,
    first_event_latency: Duration,
    deadline: Instant,
}

impl RelayObserver for StreamAccounting {
    fn finish(self: Box<Self>, outcome: RelayOutcome) {
        let Self {
            tag,
            admission,
            key_id,
            key_prefix,
            keys,
            health,
            reservation,
            first_event_latency,
            deadline,
        } = *self;
        let provider_id = admission.provider_id();

        match outcome {
            RelayOutcome::Completed(usage) => {
                let tokens = u64::from(usage.total());
                reservation.commit(tokens);
                health.record_success(provider_id, first_event_latency);
                debug!("[{}] {:?} -> {:?}", tag, RequestState::StreamingRelay, RequestState::Completed);
                spawn_accounting(async move {
                    if let Err(e) = keys.record_success(&key_id, tokens).await {
                        warn!("Failed to record usage for key {}: {}", key_prefix, e);
                    }
                });
            }
            RelayOutcome::Cancelled {
                partial_output_tokens,
            } => {
                // The provider was reached: the request counts, unused
                // token estimate goes back
                let tokens = u64::from(partial_output_tokens);
                reservation.commit(tokens);
                health.record_success(provider_id, first_event_latency);
                debug!("[{}] stream cancelled after ~{} tokens", tag, tokens);
                spawn_accounting(async move {
                    if let Err(e) = keys.record_success(&key_id, tokens).await {
                        warn!("Failed to record usage for key {}: {}", key_prefix, e);
                    }
                });
            }
            RelayOutcome::Failed(err) => {
                reservation.commit(0);
                debug!("[{}] {:?} -> {:?}", tag, RequestState::StreamingRelay, RequestState::Failed);
                if budget_spent(&err, deadline) {
                    debug!("[{}] stream cut by the request budget", tag);
                    return;
                }
                if err.counts_against_provider() {
                    health.record_failure(provider_id, None);
                }
                if let Some(kind) = err.failure_kind() {
                    spawn_accounting(async move {
                        if let Err(e) = keys.record_failure(&key_id, kind).await {
                            warn!("Failed to record failure for key {}: {}", key_prefix, e);
                        }
                    });
                }
            }
        }
    }
}

/// Key-store writes after a relay ends run detached; the relay may be
/// finishing inside a drop
fn spawn_accounting<F>(task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => warn!("No runtime available, stream accounting skipped"),
    }
}
