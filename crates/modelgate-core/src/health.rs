//! Provider health tracking and circuit breaking
//!
//! ```text
//! CLOSED ──[3 consecutive failures]──► OPEN ──[cool-down elapsed]──► HALF-OPEN
//!   ▲                                   ▲                               │
//!   │                                   └──[probe fails, cool-down ×2]──┤
//!   └───────────────────[probe succeeds]────────────────────────────────┘
//! ```
//!
//! Half-open admits exactly one probe call. The probe is held by an
//! [`Admission`]; dropping it without a recorded result hands the probe back.
//! Each provider has its own lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Weight of the newest observation in the moving averages
    pub ema_alpha: f64,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// First cool-down after the circuit opens
    pub cooldown: Duration,
    /// Ceiling for the doubled cool-down
    pub max_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ProviderHealth {
    ema_latency_ms: Option<f64>,
    ema_error_rate: f64,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
    /// Bumped on every probe claim so a stale [`Admission`] cannot release a newer probe
    probe_generation: u64,
    total_calls: u64,
    total_failures: u64,
}

impl ProviderHealth {
    fn new(config: &HealthConfig) -> Self {
        Self {
            ema_latency_ms: None,
            ema_error_rate: 0.0,
            consecutive_failures: 0,
            open_until: None,
            cooldown: config.cooldown,
            probe_in_flight: false,
            probe_generation: 0,
            total_calls: 0,
            total_failures: 0,
        }
    }

    fn state(&self, now: Instant) -> CircuitState {
        match self.open_until {
            None => CircuitState::Closed,
            Some(until) if now < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    fn observe(&mut self, alpha: f64, latency: Option<Duration>, failed: bool) {
        if let Some(latency) = latency {
            let ms = latency.as_secs_f64() * 1000.0;
            self.ema_latency_ms = Some(match self.ema_latency_ms {
                Some(prev) => alpha * ms + (1.0 - alpha) * prev,
                None => ms,
            });
        }
        let sample = if failed { 1.0 } else { 0.0 };
        self.ema_error_rate = alpha * sample + (1.0 - alpha) * self.ema_error_rate;
        self.total_calls += 1;
        if failed {
            self.total_failures += 1;
        }
    }
}

/// Point-in-time view of one provider, for routing and the admin API
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider_id: String,
    pub circuit: CircuitState,
    pub ema_latency_ms: Option<f64>,
    pub ema_error_rate: f64,
    pub consecutive_failures: u32,
    /// Time left before a probe is allowed
    pub open_for_ms: Option<u64>,
    pub cooldown_ms: u64,
    pub total_calls: u64,
    pub total_failures: u64,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    config: HealthConfig,
    providers: RwLock<HashMap<String, Arc<Mutex<ProviderHealth>>>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self, provider_id: &str) -> CircuitState {
        lock(&self.entry(provider_id)).state(Instant::now())
    }

    /// Whether the provider may be put on a candidate list. Does not claim
    /// the half-open probe; see [`admit`](Self::admit).
    pub fn is_available(&self, provider_id: &str) -> bool {
        let entry = self.entry(provider_id);
        let health = lock(&entry);
        match health.state(Instant::now()) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !health.probe_in_flight,
        }
    }

    /// Claim permission to call the provider now. In half-open state only
    /// the first caller gets through, and holds the probe until it records
    /// a result or drops the returned [`Admission`].
    pub fn admit(&self, provider_id: &str) -> Option<Admission> {
        let entry = self.entry(provider_id);
        let mut health = lock(&entry);
        let probe = match health.state(Instant::now()) {
            CircuitState::Closed => None,
            CircuitState::Open => return None,
            CircuitState::HalfOpen if health.probe_in_flight => return None,
            CircuitState::HalfOpen => {
                health.probe_in_flight = true;
                health.probe_generation += 1;
                debug!("Admitting probe call to provider '{}'", provider_id);
                Some(health.probe_generation)
            }
        };
        drop(health);
        Some(Admission {
            provider_id: provider_id.to_string(),
            probe: probe.map(|generation| (entry, generation)),
        })
    }

    pub fn record_success(&self, provider_id: &str, latency: Duration) {
        let entry = self.entry(provider_id);
        let mut health = lock(&entry);
        health.observe(self.config.ema_alpha, Some(latency), false);
        health.consecutive_failures = 0;
        if health.open_until.is_some() {
            health.open_until = None;
            health.probe_in_flight = false;
            health.cooldown = self.config.cooldown;
            info!("Circuit for provider '{}' closed", provider_id);
        }
    }

    pub fn record_failure(&self, provider_id: &str, latency: Option<Duration>) {
        let now = Instant::now();
        let entry = self.entry(provider_id);
        let mut health = lock(&entry);
        health.observe(self.config.ema_alpha, latency, true);
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);

        match health.state(now) {
            CircuitState::HalfOpen => {
                let doubled = health.cooldown.saturating_mul(2).min(self.config.max_cooldown);
                health.cooldown = doubled;
                health.open_until = Some(now + doubled);
                health.probe_in_flight = false;
                warn!(
                    "Probe to provider '{}' failed, circuit re-opened for {:?}",
                    provider_id, doubled
                );
            }
            CircuitState::Closed if health.consecutive_failures >= self.config.failure_threshold => {
                let cooldown = health.cooldown;
                health.open_until = Some(now + cooldown);
                warn!(
                    "Provider '{}' failed {} times in a row, circuit open for {:?}",
                    provider_id, health.consecutive_failures, cooldown
                );
            }
            // Late results from calls started before the circuit opened
            _ => {}
        }
    }

    /// Administrative override: forget everything about the provider
    pub fn reset(&self, provider_id: &str) {
        let entry = self.entry(provider_id);
        *lock(&entry) = ProviderHealth::new(&self.config);
        info!("Health for provider '{}' reset", provider_id);
    }

    pub fn ema_latency_ms(&self, provider_id: &str) -> Option<f64> {
        lock(&self.entry(provider_id)).ema_latency_ms
    }

    pub fn error_rate(&self, provider_id: &str) -> f64 {
        lock(&self.entry(provider_id)).ema_error_rate
    }

    pub fn snapshot_of(&self, provider_id: &str) -> HealthSnapshot {
        let now = Instant::now();
        let entry = self.entry(provider_id);
        let health = lock(&entry);
        HealthSnapshot {
            provider_id: provider_id.to_string(),
            circuit: health.state(now),
            ema_latency_ms: health.ema_latency_ms,
            ema_error_rate: health.ema_error_rate,
            consecutive_failures: health.consecutive_failures,
            open_for_ms: health
                .open_until
                .filter(|until| *until > now)
                .map(|until| until.duration_since(now).as_millis() as u64),
            cooldown_ms: health.cooldown.as_millis() as u64,
            total_calls: health.total_calls,
            total_failures: health.total_failures,
        }
    }

    /// Every provider seen so far, sorted by id
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let mut ids: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot_of(id)).collect()
    }

    fn entry(&self, provider_id: &str) -> Arc<Mutex<ProviderHealth>> {
        {
            let providers = self.providers.read().unwrap_or_else(|poisoned| {
                warn!("Health table lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(entry) = providers.get(provider_id) {
                return Arc::clone(entry);
            }
        }
        let mut providers = self.providers.write().unwrap_or_else(|poisoned| {
            warn!("Health table lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(
            providers
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(&self.config)))),
        )
    }
}

/// Permission to make one call to a provider, from [`HealthTracker::admit`]
#[must_use = "dropping an admission hands a half-open probe back immediately"]
pub struct Admission {
    provider_id: String,
    probe: Option<(Arc<Mutex<ProviderHealth>>, u64)>,
}

impl Admission {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("provider_id", &self.provider_id)
            .field("probe", &self.is_probe())
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some((entry, generation)) = self.probe.take() else {
            return;
        };
        let mut health = lock(&entry);
        if health.probe_in_flight && health.probe_generation == generation {
            health.probe_in_flight = false;
            debug!(
                "Probe to provider '{}' ended without a result, released",
                self.provider_id
            );
        }
    }
}

fn lock(entry: &Mutex<ProviderHealth>) -> MutexGuard<'_, ProviderHealth> {
    entry.lock().unwrap_or_else(|poisoned| {
        warn!("Provider health lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
