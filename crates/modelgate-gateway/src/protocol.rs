//! HTTP error envelopes
//!
//! Every failure leaves the gateway in the error shape of the format the
//! client spoke. Upstream error bodies are never forwarded as-is.

use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use modelgate_core::{GatewayError, WireFormat};

/// A gateway error bound to the wire format it must be rendered in
#[derive(Debug)]
pub struct ApiError {
    pub format: WireFormat,
    pub error: GatewayError,
}

impl ApiError {
    pub fn new(format: WireFormat, error: GatewayError) -> Self {
        Self { format, error }
    }

    /// Admin endpoints answer in the chat-completions envelope
    pub fn admin(error: GatewayError) -> Self {
        Self::new(WireFormat::ChatCompletions, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = error_response(
            self.format,
            status,
            self.error.error_type(),
            &self.error.to_string(),
        );
        if status == StatusCode::TOO_MANY_REQUESTS {
            let secs = retry_after_secs(self.error.retry_after());
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Render an error envelope with an explicit status
pub fn error_response(
    format: WireFormat,
    status: StatusCode,
    error_type: &str,
    message: &str,
) -> Response {
    let body = format.codec().error_body(error_type, message);
    (status, Json(body)).into_response()
}

/// Whole seconds, rounded up, never below one
fn retry_after_secs(hint: Option<std::time::Duration>) -> u64 {
    hint.map(|d| d.as_secs_f64().ceil() as u64).unwrap_or(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_envelope_per_format() {
        let err = || GatewayError::NoKeyAvailable {
            provider: "openai".into(),
        };

        let a = ApiError::new(WireFormat::ChatCompletions, err()).into_response();
        assert_eq!(a.status(), StatusCode::SERVICE_UNAVAILABLE);
        let a = body_json(a).await;
        assert_eq!(a["error"]["type"], "no_key_available");
        assert!(a["error"]["message"].as_str().unwrap().contains("openai"));

        let b = body_json(ApiError::new(WireFormat::Messages, err()).into_response()).await;
        assert_eq!(b["type"], "error");
        assert_eq!(b["error"]["type"], "no_key_available");
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let response = ApiError::new(
            WireFormat::Messages,
            GatewayError::RateLimitExceeded {
                scope: "provider 'p'".into(),
                retry_after: Some(Duration::from_millis(1500)),
            },
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(None), 1);
        assert_eq!(retry_after_secs(Some(Duration::ZERO)), 1);
        assert_eq!(retry_after_secs(Some(Duration::from_secs(30))), 30);
    }

    #[tokio::test]
    async fn test_upstream_auth_failure_is_bad_gateway() {
        let response = ApiError::new(
            WireFormat::ChatCompletions,
            GatewayError::UpstreamPermanent {
                provider: "p".into(),
                status: 401,
                message: "invalid x-api-key".into(),
            },
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "upstream_auth_error");
    }
}
