//! Upstream client capability
//!
//! One client per provider. It knows the provider's base URL, how to
//! authenticate and which wire format it speaks; everything it returns is
//! already canonical.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::{GatewayError, Result};
use crate::translate::WireFormat;
use crate::types::{CanonicalChatRequest, CanonicalChatResponse, CanonicalStreamDelta};

pub use http::{AuthScheme, HttpUpstream};

/// Single-pass sequence of canonical deltas from one upstream call
pub type DeltaStream = BoxStream<'static, Result<CanonicalStreamDelta>>;

pub enum UpstreamReply {
    Complete(CanonicalChatResponse),
    Stream(DeltaStream),
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(resp) => f.debug_tuple("Complete").field(resp).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn provider_id(&self) -> &str;

    fn wire_format(&self) -> WireFormat;

    /// Send one request with `secret` as the credential. Streams when
    /// `request.stream` is set.
    async fn send_chat_request(
        &self,
        request: &CanonicalChatRequest,
        secret: &str,
    ) -> Result<UpstreamReply>;
}

/// Upstream clients by provider id
#[derive(Default, Clone)]
pub struct UpstreamRegistry {
    clients: HashMap<String, Arc<dyn UpstreamClient>>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn UpstreamClient>) {
        self.clients.insert(client.provider_id().to_string(), client);
    }

    pub fn with(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.register(client);
        self
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn UpstreamClient>> {
        self.clients.get(provider_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Fill in the provider on errors raised by provider-agnostic code
pub(crate) fn attribute(err: GatewayError, provider_id: &str) -> GatewayError {
    match err {
        GatewayError::UpstreamTransient {
            provider,
            status,
            message,
            timed_out,
        } if provider.is_empty() => GatewayError::UpstreamTransient {
            provider: provider_id.to_string(),
            status,
            message,
            timed_out,
        },
        other => other,
    }
}
