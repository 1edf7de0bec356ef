//! Gateway error taxonomy
//!
//! Every failure a request can hit maps to exactly one variant here. The
//! variant decides the HTTP status, the `type` reported in the error
//! envelope, and whether the router may try another provider.

use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// How an upstream failure should be charged against the key that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 from the provider: the key is bad and gets deactivated.
    Auth,
    /// The account behind the key is unusable (402 and friends).
    Permanent,
    /// 429 from the provider.
    RateLimited,
    /// 5xx, timeouts and network errors.
    Transient,
}

impl FailureKind {
    /// Whether this failure should take the key out of rotation for good.
    pub fn deactivates_key(&self) -> bool {
        matches!(self, Self::Auth | Self::Permanent)
    }

    /// Whether this failure should park the key for the degradation period.
    pub fn degrades_key(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient)
    }
}

/// Errors that can occur while serving a gateway request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or incomplete client input.
    #[error("{0}")]
    Validation(String),

    /// Every key for the provider is inactive, degraded or out of capacity.
    #[error("no API key available for provider '{provider}'")]
    NoKeyAvailable { provider: String },

    /// A local rate limit rejected the reservation.
    #[error("rate limit exceeded for {scope}")]
    RateLimitExceeded {
        scope: String,
        retry_after: Option<Duration>,
    },

    /// No configured provider serves the requested model.
    #[error("model '{0}' is not served by any provider")]
    ModelNotFound(String),

    /// Providers exist for the model but none can take the request now.
    #[error("all providers for model '{model}' are unavailable")]
    AllProvidersExhausted { model: String },

    /// 5xx, timeout or network failure talking to a provider.
    #[error("upstream '{provider}' failed: {message}")]
    UpstreamTransient {
        provider: String,
        status: Option<u16>,
        message: String,
        timed_out: bool,
    },

    /// The provider rejected the call with a 429.
    #[error("upstream '{provider}' rate limited the request: {message}")]
    UpstreamRateLimited {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 4xx from the provider; never retried.
    #[error("upstream '{provider}' rejected the request ({status}): {message}")]
    UpstreamPermanent {
        provider: String,
        status: u16,
        message: String,
    },

    /// An upstream payload had a shape the translator cannot express.
    #[error("translation failed: {0}")]
    Translation(String),

    /// Key store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Anything else that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation(msg.into())
    }

    /// HTTP status the front-end answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NoKeyAvailable { .. } => 503,
            Self::RateLimitExceeded { .. } => 429,
            Self::ModelNotFound(_) => 404,
            Self::AllProvidersExhausted { .. } => 503,
            Self::UpstreamTransient { timed_out, .. } => {
                if *timed_out {
                    504
                } else {
                    502
                }
            }
            Self::UpstreamRateLimited { .. } => 429,
            Self::UpstreamPermanent { status, .. } => match status {
                // The client cannot fix our credentials
                401..=403 => 502,
                s if (400..500).contains(s) => *s,
                _ => 502,
            },
            Self::Translation(_) => 502,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }

    /// Machine-readable `type` for the error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::NoKeyAvailable { .. } => "no_key_available",
            Self::RateLimitExceeded { .. } | Self::UpstreamRateLimited { .. } => {
                "rate_limit_error"
            }
            Self::ModelNotFound(_) => "not_found_error",
            Self::AllProvidersExhausted { .. } => "overloaded_error",
            Self::UpstreamTransient { timed_out: true, .. } => "timeout_error",
            Self::UpstreamTransient { .. } => "upstream_error",
            Self::UpstreamPermanent {
                status: 401..=403, ..
            } => "upstream_auth_error",
            Self::UpstreamPermanent { .. } => "invalid_request_error",
            Self::Translation(_) => "translation_error",
            Self::Storage(_) | Self::Internal(_) => "api_error",
        }
    }

    /// Whether the router may advance to the next candidate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient { .. } | Self::UpstreamRateLimited { .. }
        )
    }

    /// Hint for the `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. }
            | Self::UpstreamRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// How this failure is charged to the key that made the call, if at all.
    /// A plain 4xx is the request's fault, not the key's.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::UpstreamTransient { .. } => Some(FailureKind::Transient),
            Self::UpstreamRateLimited { .. } => Some(FailureKind::RateLimited),
            Self::UpstreamPermanent { status: 401 | 403, .. } => Some(FailureKind::Auth),
            Self::UpstreamPermanent { status: 402, .. } => Some(FailureKind::Permanent),
            _ => None,
        }
    }

    /// Whether the provider itself misbehaved (feeds the health tracker).
    pub fn counts_against_provider(&self) -> bool {
        matches!(self, Self::UpstreamTransient { .. } | Self::Translation(_))
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
