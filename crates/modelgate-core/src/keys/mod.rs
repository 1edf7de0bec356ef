//! Provider API keys: records, persistence and selection

pub mod manager;
pub mod store;

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use manager::{KeyManager, KeyManagerConfig};
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore};

/// One provider credential plus its usage window
#[derive(Clone, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub provider_id: String,
    pub secret: String,
    /// Safe to log and display
    pub prefix: String,
    pub active: bool,
    pub degraded_until: Option<DateTime<Utc>>,
    pub window_requests: u64,
    pub window_tokens: u64,
    pub window_start: DateTime<Utc>,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("secret", &"[REDACTED]")
            .field("prefix", &self.prefix)
            .field("active", &self.active)
            .field("degraded_until", &self.degraded_until)
            .field("window_requests", &self.window_requests)
            .field("window_tokens", &self.window_tokens)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl ApiKey {
    pub fn new(provider_id: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            provider_id: provider_id.into(),
            prefix: mask_secret(&secret),
            secret,
            active: true,
            degraded_until: None,
            window_requests: 0,
            window_tokens: 0,
            window_start: now,
            total_requests: 0,
            total_tokens: 0,
            last_used_at: None,
            created_at: now,
        }
    }

    pub fn is_degraded(&self, now: DateTime<Utc>) -> bool {
        self.degraded_until.is_some_and(|until| until > now)
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_degraded(now)
    }

    /// requests + tokens/1000 over the current window
    pub fn usage_score(&self) -> f64 {
        self.window_requests as f64 + self.window_tokens as f64 / 1000.0
    }

    /// Clear an expired degradation and roll the usage window if its
    /// boundary has passed. Returns whether anything changed.
    pub fn normalize(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        let mut changed = false;
        if self.degraded_until.is_some_and(|until| until <= now) {
            self.degraded_until = None;
            changed = true;
        }
        let boundary = window_boundary(now, window);
        if boundary > self.window_start {
            self.window_start = boundary;
            self.window_requests = 0;
            self.window_tokens = 0;
            changed = true;
        }
        changed
    }

    pub fn view(&self, now: DateTime<Utc>) -> KeyView {
        KeyView {
            id: self.id.clone(),
            provider_id: self.provider_id.clone(),
            prefix: self.prefix.clone(),
            active: self.active,
            degraded_until: self.degraded_until.filter(|until| *until > now),
            window_requests: self.window_requests,
            window_tokens: self.window_tokens,
            window_start: self.window_start,
            total_requests: self.total_requests,
            total_tokens: self.total_tokens,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
        }
    }
}

/// Admin-facing projection of a key; never carries the secret
#[derive(Debug, Clone, Serialize)]
pub struct KeyView {
    pub id: String,
    pub provider_id: String,
    pub prefix: String,
    pub active: bool,
    pub degraded_until: Option<DateTime<Utc>>,
    pub window_requests: u64,
    pub window_tokens: u64,
    pub window_start: DateTime<Utc>,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Start of the usage window containing `now`, aligned to the epoch
fn window_boundary(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
    let start = now.timestamp().div_euclid(window_secs) * window_secs;
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}

/// Show the first 3 and last 4 characters of a secret
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}
