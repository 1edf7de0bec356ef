//! Gateway HTTP server: Axum routes for both chat formats plus admin

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use modelgate_core::keys::mask_secret;
use modelgate_core::{
    HealthTracker, KeyManager, RateLimiter, Router as ProviderRouter, Strategy, UpstreamRegistry,
    WireFormat,
};

use crate::pipeline;

/// Request-handling knobs
#[derive(Clone)]
pub struct GatewaySettings {
    pub strategy: Strategy,
    /// Upstream calls per request, across all candidates
    pub max_attempts: usize,
    /// Whole-request budget, streaming included
    pub request_timeout: Duration,
    /// Bearer token for `/admin`; empty disables the admin API
    pub admin_token: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::Balanced,
            max_attempts: 3,
            request_timeout: Duration::from_secs(600),
            admin_token: String::new(),
        }
    }
}

impl std::fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySettings")
            .field("strategy", &self.strategy)
            .field("max_attempts", &self.max_attempts)
            .field("request_timeout", &self.request_timeout)
            .field("admin_token", &mask_secret(&self.admin_token))
            .finish()
    }
}

/// Shared state for all requests
#[derive(Clone)]
pub struct GatewayState {
    pub keys: Arc<KeyManager>,
    pub limiter: Arc<RateLimiter>,
    pub health: Arc<HealthTracker>,
    pub router: Arc<ProviderRouter>,
    pub upstreams: Arc<UpstreamRegistry>,
    pub settings: Arc<GatewaySettings>,
    /// Cancelled on shutdown; open streams watch a child of it
    pub shutdown: CancellationToken,
    pub start_time: std::time::Instant,
}

impl GatewayState {
    pub fn new(
        keys: Arc<KeyManager>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthTracker>,
        router: Arc<ProviderRouter>,
        upstreams: UpstreamRegistry,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            keys,
            limiter,
            health,
            router,
            upstreams: Arc::new(upstreams),
            settings: Arc::new(settings),
            shutdown: CancellationToken::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// The gateway server
pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, state: GatewayState) -> Self {
        Self { state, bind }
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) -> anyhow::Result<()> {
        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!("Gateway listening on {}", self.bind);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway stopped");
        Ok(())
    }

    /// Start the server in the background, returning a handle
    pub fn spawn(self) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .merge(crate::admin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── HTTP Handlers ──

async fn chat_completions_handler(State(state): State<GatewayState>, body: Bytes) -> Response {
    pipeline::handle_chat(state, WireFormat::ChatCompletions, body).await
}

async fn messages_handler(State(state): State<GatewayState>, body: Bytes) -> Response {
    pipeline::handle_chat(state, WireFormat::Messages, body).await
}

async fn health_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "providers": state.router.providers().len(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Served models in the chat-completions list shape. Prefix patterns are
/// not listed; aliases are.
async fn models_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let mut seen = std::collections::BTreeMap::new();
    for provider in state.router.providers() {
        let names = provider
            .models
            .iter()
            .filter(|m| !m.ends_with('*'))
            .chain(provider.model_aliases.keys());
        for name in names {
            seen.entry(name.clone()).or_insert_with(|| provider.id.clone());
        }
    }
    let data: Vec<_> = seen
        .into_iter()
        .map(|(id, owner)| {
            serde_json::json!({"id": id, "object": "model", "created": 0, "owned_by": owner})
        })
        .collect();
    axum::Json(serde_json::json!({"object": "list", "data": data}))
}
