//! modelgate-core: translation, keys, limits and routing for the gateway
//!
//! Everything here is transport-agnostic. The HTTP front-end lives in
//! `modelgate-gateway`; this crate only knows canonical requests, the two
//! wire formats, and the bookkeeping around upstream providers.

pub mod error;
pub mod health;
pub mod keys;
pub mod rate_limit;
pub mod router;
pub mod stream;
pub mod translate;
pub mod types;
pub mod upstream;

pub use error::{FailureKind, GatewayError, Result};
pub use health::{Admission, CircuitState, HealthConfig, HealthSnapshot, HealthTracker};
pub use keys::{ApiKey, KeyManager, KeyManagerConfig, KeyStore, KeyView, MemoryKeyStore, SqliteKeyStore};
pub use rate_limit::{LimitType, RateLimitSpec, RateLimiter, Reservation, Scope, Units};
pub use router::{Candidate, ProviderProfile, RouteConstraints, Router, Strategy};
pub use stream::{RelayObserver, RelayOptions, RelayOutcome, relay};
pub use translate::{SseFrame, WireFormat};
pub use types::{
    CanonicalChatRequest, CanonicalChatResponse, CanonicalMessage, CanonicalStreamDelta,
    ContentPart, Role, StopReason, Usage,
};
pub use upstream::{AuthScheme, HttpUpstream, UpstreamClient, UpstreamRegistry, UpstreamReply};
