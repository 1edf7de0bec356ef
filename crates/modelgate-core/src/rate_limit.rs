//! Token-bucket rate limiting per provider and per key
//!
//! Every scope owns one bucket per configured limit type, all behind a
//! single mutex for that scope. A consumption checks the whole set before
//! touching any bucket, so it either draws from every bucket or none.
//! Contention stays local: two scopes never share a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Key selector in a [`RateLimitSpec`] that applies to every key of the provider
pub const EACH_KEY: &str = "*";

/// What a set of buckets is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Provider(String),
    Key { provider: String, key: String },
}

impl Scope {
    pub fn provider(id: impl Into<String>) -> Self {
        Self::Provider(id.into())
    }

    pub fn key(provider: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Key {
            provider: provider.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(p) => write!(f, "provider '{}'", p),
            Self::Key { provider, key } => write!(f, "key '{}' of provider '{}'", key, provider),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    RequestsPerMinute,
    TokensPerMinute,
    RequestsPerDay,
    /// In-flight calls; returned on completion instead of refilling
    Concurrent,
}

impl LimitType {
    pub fn default_window(self) -> Duration {
        match self {
            Self::RequestsPerMinute | Self::TokensPerMinute | Self::Concurrent => {
                Duration::from_secs(60)
            }
            Self::RequestsPerDay => Duration::from_secs(86_400),
        }
    }

    fn draw(self, units: Units) -> f64 {
        match self {
            Self::TokensPerMinute => units.tokens as f64,
            Self::RequestsPerMinute | Self::RequestsPerDay | Self::Concurrent => {
                units.requests as f64
            }
        }
    }
}

/// Amount drawn by one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Units {
    pub requests: u64,
    pub tokens: u64,
}

impl Units {
    /// A single request carrying an estimated token count
    pub fn request(tokens: u64) -> Self {
        Self {
            requests: 1,
            tokens,
        }
    }

    fn tokens_only(tokens: u64) -> Self {
        Self {
            requests: 0,
            tokens,
        }
    }
}

/// One configured limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub provider_id: String,
    /// `None` limits the provider as a whole; [`EACH_KEY`] applies the
    /// limit separately to every key of the provider
    pub key_id: Option<String>,
    pub limit_type: LimitType,
    pub limit: u64,
    pub burst: u64,
    pub window: Duration,
}

impl RateLimitSpec {
    pub fn new(provider_id: impl Into<String>, limit_type: LimitType, limit: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            key_id: None,
            limit_type,
            limit,
            burst: 0,
            window: limit_type.default_window(),
        }
    }

    pub fn for_key(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn capacity(&self) -> f64 {
        (self.limit + self.burst) as f64
    }

    fn refill_per_sec(&self) -> f64 {
        if self.limit_type == LimitType::Concurrent || self.window.is_zero() {
            0.0
        } else {
            self.limit as f64 / self.window.as_secs_f64()
        }
    }

    fn applies_to(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Provider(p) => self.key_id.is_none() && &self.provider_id == p,
            Scope::Key { provider, key } => {
                &self.provider_id == provider
                    && self
                        .key_id
                        .as_deref()
                        .is_some_and(|k| k == EACH_KEY || k == key)
            }
        }
    }
}

// ── Buckets ──

#[derive(Debug)]
struct Bucket {
    limit_type: LimitType,
    capacity: f64,
    level: f64,
    refill_per_sec: f64,
    window: Duration,
    last_refill: Instant,
    last_draw: Instant,
}

impl Bucket {
    fn new(spec: &RateLimitSpec, now: Instant) -> Self {
        Self {
            limit_type: spec.limit_type,
            capacity: spec.capacity(),
            level: spec.capacity(),
            refill_per_sec: spec.refill_per_sec(),
            window: spec.window,
            last_refill: now,
            last_draw: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.refill_per_sec == 0.0 {
            return;
        }
        // A full quiet window restores the burst as well
        if now.duration_since(self.last_draw) >= self.window {
            self.level = self.capacity;
        } else {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.level = (self.level + elapsed * self.refill_per_sec).min(self.capacity);
        }
        self.last_refill = now;
    }

    fn has(&self, amount: f64) -> bool {
        amount == 0.0 || self.level >= amount
    }

    fn take(&mut self, amount: f64, now: Instant) {
        if amount > 0.0 {
            self.level = (self.level - amount).max(0.0);
            self.last_draw = now;
        }
    }

    fn give(&mut self, amount: f64) {
        self.level = (self.level + amount).min(self.capacity);
    }

    fn wait_for(&self, amount: f64) -> Option<Duration> {
        if amount > self.capacity || self.refill_per_sec == 0.0 {
            return None;
        }
        let deficit = (amount - self.level).max(0.0);
        Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    buckets: Vec<Bucket>,
}

impl ScopeState {
    fn build(specs: &[RateLimitSpec], now: Instant) -> Self {
        Self {
            buckets: specs.iter().map(|s| Bucket::new(s, now)).collect(),
        }
    }

    /// Check every bucket first, then draw from all of them
    fn try_consume(&mut self, units: Units, now: Instant) -> std::result::Result<(), Option<Duration>> {
        for bucket in &mut self.buckets {
            bucket.refill(now);
        }
        if let Some(short) = self
            .buckets
            .iter()
            .find(|b| !b.has(b.limit_type.draw(units)))
        {
            return Err(short.wait_for(short.limit_type.draw(units)));
        }
        for bucket in &mut self.buckets {
            let amount = bucket.limit_type.draw(units);
            bucket.take(amount, now);
        }
        Ok(())
    }

    fn peek(&mut self, units: Units, now: Instant) -> bool {
        self.buckets.iter_mut().all(|b| {
            b.refill(now);
            b.has(b.limit_type.draw(units))
        })
    }

    fn give(&mut self, units: Units, only: Option<LimitType>) {
        for bucket in &mut self.buckets {
            if only.is_none_or(|t| t == bucket.limit_type) {
                let amount = bucket.limit_type.draw(units);
                bucket.give(amount);
            }
        }
    }

    fn charge(&mut self, units: Units, now: Instant) {
        for bucket in &mut self.buckets {
            bucket.refill(now);
            let amount = bucket.limit_type.draw(units);
            bucket.take(amount, now);
        }
    }
}

// ── Limiter ──

/// Shared limiter for every provider and key scope
#[derive(Debug, Default)]
pub struct RateLimiter {
    specs: RwLock<Vec<RateLimitSpec>>,
    scopes: RwLock<HashMap<Scope, Arc<Mutex<ScopeState>>>>,
}

impl RateLimiter {
    pub fn new(specs: Vec<RateLimitSpec>) -> Self {
        Self {
            specs: RwLock::new(specs),
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the limit configuration. Existing buckets keep their level,
    /// clamped to the new capacity.
    pub fn update_specs(&self, specs: Vec<RateLimitSpec>) {
        let now = Instant::now();
        {
            let mut current = self.specs.write().unwrap_or_else(|poisoned| {
                warn!("Rate limit spec lock was poisoned, recovering");
                poisoned.into_inner()
            });
            *current = specs;
        }

        let scopes = self.scopes.read().unwrap_or_else(|poisoned| {
            warn!("Rate limit scope lock was poisoned, recovering");
            poisoned.into_inner()
        });
        for (scope, state) in scopes.iter() {
            let fresh = self.specs_for(scope);
            let mut state = lock_state(state);
            let mut rebuilt = ScopeState::build(&fresh, now);
            for bucket in &mut rebuilt.buckets {
                if let Some(old) = state
                    .buckets
                    .iter_mut()
                    .find(|b| b.limit_type == bucket.limit_type)
                {
                    old.refill(now);
                    bucket.level = old.level.min(bucket.capacity);
                    bucket.last_draw = old.last_draw;
                }
            }
            *state = rebuilt;
        }
        debug!("Rate limit specs updated for {} live scopes", scopes.len());
    }

    /// Draw `units` from every bucket of `scope`, or from none of them
    pub fn try_consume(&self, scope: &Scope, units: Units) -> bool {
        self.consume(scope, units).is_ok()
    }

    /// Whether `units` could be drawn right now, without drawing them
    pub fn peek(&self, scope: &Scope, units: Units) -> bool {
        lock_state(&self.state(scope)).peek(units, Instant::now())
    }

    /// Return previously consumed units to every bucket of the scope
    pub fn rollback(&self, scope: &Scope, units: Units) {
        lock_state(&self.state(scope)).give(units, None);
    }

    /// Return in-flight slots once a call has finished
    pub fn release(&self, scope: &Scope, units: Units) {
        lock_state(&self.state(scope)).give(units, Some(LimitType::Concurrent));
    }

    /// How long until `units` would fit, if they ever can by waiting
    pub fn retry_after(&self, scope: &Scope, units: Units) -> Option<Duration> {
        let state = self.state(scope);
        let mut state = lock_state(&state);
        let now = Instant::now();
        state
            .buckets
            .iter_mut()
            .filter_map(|b| {
                b.refill(now);
                let amount = b.limit_type.draw(units);
                if b.has(amount) { None } else { b.wait_for(amount) }
            })
            .max()
    }

    /// Reserve `units` across several scopes at once. A failure in any
    /// scope rolls back the scopes already drawn from.
    pub fn reserve(self: &Arc<Self>, scopes: Vec<Scope>, units: Units) -> Result<Reservation> {
        for (i, scope) in scopes.iter().enumerate() {
            if let Err(retry_after) = self.consume(scope, units) {
                for drawn in &scopes[..i] {
                    self.rollback(drawn, units);
                }
                debug!("Rate limit reservation refused for {}", scope);
                return Err(GatewayError::RateLimitExceeded {
                    scope: scope.to_string(),
                    retry_after,
                });
            }
        }
        Ok(Reservation {
            limiter: Arc::clone(self),
            scopes,
            units,
            settled: false,
        })
    }

    fn consume(&self, scope: &Scope, units: Units) -> std::result::Result<(), Option<Duration>> {
        lock_state(&self.state(scope)).try_consume(units, Instant::now())
    }

    fn charge(&self, scope: &Scope, units: Units) {
        lock_state(&self.state(scope)).charge(units, Instant::now());
    }

    fn specs_for(&self, scope: &Scope) -> Vec<RateLimitSpec> {
        let specs = self.specs.read().unwrap_or_else(|poisoned| {
            warn!("Rate limit spec lock was poisoned, recovering");
            poisoned.into_inner()
        });
        specs.iter().filter(|s| s.applies_to(scope)).cloned().collect()
    }

    fn state(&self, scope: &Scope) -> Arc<Mutex<ScopeState>> {
        {
            let scopes = self.scopes.read().unwrap_or_else(|poisoned| {
                warn!("Rate limit scope lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(state) = scopes.get(scope) {
                return Arc::clone(state);
            }
        }

        let specs = self.specs_for(scope);
        let mut scopes = self.scopes.write().unwrap_or_else(|poisoned| {
            warn!("Rate limit scope lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(
            scopes
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ScopeState::build(&specs, Instant::now())))),
        )
    }
}

fn lock_state(state: &Mutex<ScopeState>) -> MutexGuard<'_, ScopeState> {
    state.lock().unwrap_or_else(|poisoned| {
        warn!("Rate limit bucket lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Units held for one upstream call. Dropping it without [`commit`]
/// returns everything, which covers calls that never reached a provider
/// and clients that went away.
///
/// [`commit`]: Reservation::commit
#[derive(Debug)]
pub struct Reservation {
    limiter: Arc<RateLimiter>,
    scopes: Vec<Scope>,
    units: Units,
    settled: bool,
}

impl Reservation {
    pub fn units(&self) -> Units {
        self.units
    }

    /// Settle against the real token count: unused estimate is refunded,
    /// overruns are charged, and concurrency slots are released
    pub fn commit(mut self, actual_tokens: u64) {
        self.settled = true;
        let estimate = self.units.tokens;
        for scope in &self.scopes {
            if actual_tokens < estimate {
                self.limiter
                    .rollback(scope, Units::tokens_only(estimate - actual_tokens));
            } else if actual_tokens > estimate {
                self.limiter
                    .charge(scope, Units::tokens_only(actual_tokens - estimate));
            }
            self.limiter.release(scope, self.units);
        }
    }

    /// Give back everything that was reserved
    pub fn rollback(mut self) {
        self.settled = true;
        self.undo();
    }

    fn undo(&self) {
        for scope in &self.scopes {
            self.limiter.rollback(scope, self.units);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Uncommitted rate limit reservation dropped, rolling back");
            self.undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpm(provider: &str, limit: u64, burst: u64) -> RateLimitSpec {
        RateLimitSpec::new(provider, LimitType::RequestsPerMinute, limit).with_burst(burst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_exhaustion_then_full_restore() {
        let limiter = RateLimiter::new(vec![rpm("p", 60, 10)]);
        let scope = Scope::provider("p");
        let one = Units::request(0);

        for i in 0..70 {
            assert!(limiter.try_consume(&scope, one), "consume {} failed", i + 1);
        }
        assert!(!limiter.try_consume(&scope, one));

        tokio::time::advance(Duration::from_secs(60)).await;
        for i in 0..70 {
            assert!(limiter.try_consume(&scope, one), "after window {} failed", i + 1);
        }
        assert!(!limiter.try_consume(&scope, one));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_refill() {
        let limiter = RateLimiter::new(vec![rpm("p", 60, 0)]);
        let scope = Scope::provider("p");
        for _ in 0..60 {
            assert!(limiter.try_consume(&scope, Units::request(0)));
        }
        assert!(!limiter.try_consume(&scope, Units::request(0)));

        tokio::time::advance(Duration::from_secs(5)).await;
        for _ in 0..5 {
            assert!(limiter.try_consume(&scope, Units::request(0)));
        }
        assert!(!limiter.try_consume(&scope, Units::request(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumption_is_all_or_nothing() {
        let limiter = RateLimiter::new(vec![
            rpm("p", 10, 0),
            RateLimitSpec::new("p", LimitType::TokensPerMinute, 100),
        ]);
        let scope = Scope::provider("p");

        assert!(limiter.try_consume(&scope, Units::request(90)));
        // Request bucket has room, token bucket does not
        assert!(!limiter.try_consume(&scope, Units::request(50)));
        // The failed call must not have drawn a request slot
        for _ in 0..9 {
            assert!(limiter.try_consume(&scope, Units::request(1)));
        }
        assert!(!limiter.try_consume(&scope, Units::request(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_restores_capacity() {
        let limiter = RateLimiter::new(vec![rpm("p", 2, 0)]);
        let scope = Scope::provider("p");
        assert!(limiter.try_consume(&scope, Units::request(0)));
        assert!(limiter.try_consume(&scope, Units::request(0)));
        assert!(!limiter.peek(&scope, Units::request(0)));

        limiter.rollback(&scope, Units::request(0));
        assert!(limiter.peek(&scope, Units::request(0)));
    }

    #[test]
    fn test_unconfigured_scope_is_unlimited() {
        let limiter = RateLimiter::default();
        let scope = Scope::key("p", "k");
        for _ in 0..1000 {
            assert!(limiter.try_consume(&scope, Units::request(10_000)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_key_spec_applies_per_key() {
        let limiter = RateLimiter::new(vec![rpm("p", 1, 0).for_key(EACH_KEY)]);
        assert!(limiter.try_consume(&Scope::key("p", "a"), Units::request(0)));
        assert!(!limiter.try_consume(&Scope::key("p", "a"), Units::request(0)));
        assert!(limiter.try_consume(&Scope::key("p", "b"), Units::request(0)));
        // Key specs never limit the provider scope itself
        assert!(limiter.try_consume(&Scope::provider("p"), Units::request(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_released_not_refilled() {
        let limiter = RateLimiter::new(vec![RateLimitSpec::new("p", LimitType::Concurrent, 1)]);
        let scope = Scope::provider("p");
        assert!(limiter.try_consume(&scope, Units::request(0)));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!limiter.try_consume(&scope, Units::request(0)));
        limiter.release(&scope, Units::request(0));
        assert!(limiter.try_consume(&scope, Units::request(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_drop_rolls_back_every_scope() {
        let limiter = Arc::new(RateLimiter::new(vec![
            rpm("p", 1, 0),
            rpm("p", 1, 0).for_key("k"),
        ]));
        let scopes = vec![Scope::provider("p"), Scope::key("p", "k")];

        let reservation = limiter.reserve(scopes.clone(), Units::request(0)).unwrap();
        assert!(limiter.reserve(scopes.clone(), Units::request(0)).is_err());
        drop(reservation);
        assert!(limiter.reserve(scopes, Units::request(0)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_partial_failure_leaves_no_trace() {
        let limiter = Arc::new(RateLimiter::new(vec![
            rpm("p", 5, 0),
            rpm("p", 0, 0).for_key("k"),
        ]));
        let err = limiter
            .reserve(
                vec![Scope::provider("p"), Scope::key("p", "k")],
                Units::request(0),
            )
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(err.to_string().contains("key 'k'"));
        for _ in 0..5 {
            assert!(limiter.try_consume(&Scope::provider("p"), Units::request(0)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_refunds_unused_tokens() {
        let limiter = Arc::new(RateLimiter::new(vec![
            RateLimitSpec::new("p", LimitType::TokensPerMinute, 1000),
            RateLimitSpec::new("p", LimitType::Concurrent, 1),
        ]));
        let scope = Scope::provider("p");

        let reservation = limiter.reserve(vec![scope.clone()], Units::request(800)).unwrap();
        assert!(!limiter.peek(&scope, Units::request(300)));
        reservation.commit(100);

        // 900 tokens left and the in-flight slot is free again
        assert!(limiter.peek(&scope, Units::request(900)));
        assert!(!limiter.peek(&scope, Units::request(901)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint() {
        let limiter = Arc::new(RateLimiter::new(vec![rpm("p", 60, 0)]));
        let scope = Scope::provider("p");
        for _ in 0..60 {
            assert!(limiter.try_consume(&scope, Units::request(0)));
        }
        let err = limiter.reserve(vec![scope.clone()], Units::request(0)).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(limiter.retry_after(&scope, Units::request(0)), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_specs_keeps_levels() {
        let limiter = RateLimiter::new(vec![rpm("p", 10, 0)]);
        let scope = Scope::provider("p");
        for _ in 0..8 {
            assert!(limiter.try_consume(&scope, Units::request(0)));
        }
        limiter.update_specs(vec![rpm("p", 100, 0)]);
        // Level carried over (2 left), capacity raised
        assert!(limiter.try_consume(&scope, Units::request(0)));
        assert!(limiter.try_consume(&scope, Units::request(0)));
        assert!(!limiter.try_consume(&scope, Units::request(0)));
    }

    #[test]
    fn test_concurrent_consumers_never_over_draw() {
        let limiter = Arc::new(RateLimiter::new(vec![
            RateLimitSpec::new("p", LimitType::RequestsPerDay, 100),
        ]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.try_consume(&Scope::provider("p"), Units::request(0)))
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }
}
