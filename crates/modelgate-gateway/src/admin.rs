//! Admin API: key management and provider health

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use modelgate_core::{GatewayError, WireFormat};

use crate::auth;
use crate::protocol::{ApiError, error_response};
use crate::server::GatewayState;

pub fn routes() -> Router<GatewayState> {
    Router::new()
        .route("/admin/keys", post(add_key).get(list_keys))
        .route("/admin/keys/{id}/deactivate", post(deactivate_key))
        .route("/admin/providers", get(list_providers))
        .route("/admin/providers/{id}/reset", post(reset_provider))
}

#[derive(Deserialize)]
struct AddKeyRequest {
    provider: String,
    secret: String,
}

impl std::fmt::Debug for AddKeyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddKeyRequest")
            .field("provider", &self.provider)
            .field("secret", &modelgate_core::keys::mask_secret(&self.secret))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct KeysQuery {
    provider: Option<String>,
}

fn unauthorized() -> Response {
    error_response(
        WireFormat::ChatCompletions,
        StatusCode::UNAUTHORIZED,
        "authentication_error",
        "missing or invalid admin token",
    )
}

fn not_found(what: &str) -> Response {
    error_response(
        WireFormat::ChatCompletions,
        StatusCode::NOT_FOUND,
        "not_found_error",
        what,
    )
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    auth::is_admin(&state.settings.admin_token, headers)
}

async fn add_key(State(state): State<GatewayState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let req: AddKeyRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return ApiError::admin(GatewayError::validation(format!("invalid JSON body: {}", e)))
                .into_response();
        }
    };
    if state.router.provider(&req.provider).is_none() {
        return not_found(&format!("unknown provider '{}'", req.provider));
    }

    match state.keys.add_key(&req.provider, &req.secret).await {
        Ok(view) => {
            info!("Admin added key {} for '{}'", view.prefix, view.provider_id);
            (StatusCode::CREATED, Json(view)).into_response()
        }
        Err(e) => ApiError::admin(e).into_response(),
    }
}

async fn list_keys(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<KeysQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.keys.list_keys(query.provider.as_deref()).await {
        Ok(keys) => Json(json!({ "keys": keys })).into_response(),
        Err(e) => ApiError::admin(e).into_response(),
    }
}

async fn deactivate_key(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.keys.deactivate(&id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => ApiError::admin(e).into_response(),
    }
}

async fn list_providers(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let providers: Vec<_> = state
        .router
        .providers()
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "wire_format": p.wire_format,
                "models": p.models,
                "cost_per_1k_tokens": p.cost_per_1k_tokens,
                "supports_streaming": p.supports_streaming,
                "health": state.health.snapshot_of(&p.id),
            })
        })
        .collect();
    Json(json!({ "providers": providers })).into_response()
}

async fn reset_provider(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    if state.router.provider(&id).is_none() {
        return not_found(&format!("unknown provider '{}'", id));
    }
    state.health.reset(&id);
    Json(state.health.snapshot_of(&id)).into_response()
}
