//! Provider selection across routing strategies
//!
//! The router only orders candidates. Trying them one after another, and
//! deciding when to give up, is the front-end's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::health::HealthTracker;
use crate::rate_limit::{RateLimiter, Scope, Units};
use crate::translate::WireFormat;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Lowest cost per token first
    Cheapest,
    /// Lowest average latency first
    Fastest,
    /// Weighted cost, latency and error rate
    #[default]
    Balanced,
    /// Rotate through eligible providers
    RoundRobin,
    /// Configured order
    FallbackChain,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cheapest => "cheapest",
            Self::Fastest => "fastest",
            Self::Balanced => "balanced",
            Self::RoundRobin => "round_robin",
            Self::FallbackChain => "fallback_chain",
        };
        f.write_str(name)
    }
}

/// What the router knows about one upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub wire_format: WireFormat,
    /// Exact model names, or prefixes ending in `*`
    pub models: Vec<String>,
    /// Client-facing model name → the name this provider expects
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

impl ProviderProfile {
    pub fn serves(&self, model: &str) -> bool {
        self.model_aliases.contains_key(model)
            || self.models.iter().any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => model.starts_with(prefix),
                None => pattern == model,
            })
    }

    /// Model name to send upstream
    pub fn upstream_model(&self, model: &str) -> String {
        self.model_aliases
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// What a request needs from a provider
#[derive(Debug, Clone)]
pub struct RouteConstraints {
    pub model: String,
    pub stream: bool,
    /// Estimated draw, checked against provider-scope limits
    pub units: Units,
}

#[derive(Debug, Clone, Copy)]
pub struct BalancedWeights {
    pub cost: f64,
    pub latency: f64,
    pub health: f64,
}

impl Default for BalancedWeights {
    fn default() -> Self {
        Self {
            cost: 0.4,
            latency: 0.3,
            health: 0.3,
        }
    }
}

/// One provider to try, with the model name it should receive
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderProfile>,
    pub upstream_model: String,
}

pub struct Router {
    /// Configured order; also the fallback chain
    providers: Vec<Arc<ProviderProfile>>,
    health: Arc<HealthTracker>,
    limiter: Arc<RateLimiter>,
    weights: BalancedWeights,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(
        providers: Vec<ProviderProfile>,
        health: Arc<HealthTracker>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            health,
            limiter,
            weights: BalancedWeights::default(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_weights(mut self, weights: BalancedWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn providers(&self) -> &[Arc<ProviderProfile>] {
        &self.providers
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<ProviderProfile>> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Ordered candidates for a request.
    ///
    /// No provider serving the model is `ModelNotFound`; providers that
    /// serve it but are all circuit-open are `AllProvidersExhausted`.
    /// Providers whose own rate-limit window is full go to the back of the
    /// list, so the reservation can report how long to wait.
    pub fn select_providers(
        &self,
        constraints: &RouteConstraints,
        strategy: Strategy,
    ) -> Result<Vec<Candidate>> {
        let capable: Vec<&Arc<ProviderProfile>> = self
            .providers
            .iter()
            .filter(|p| p.serves(&constraints.model))
            .collect();
        if capable.is_empty() {
            return Err(GatewayError::ModelNotFound(constraints.model.clone()));
        }
        if constraints.stream && !capable.iter().any(|p| p.supports_streaming) {
            return Err(GatewayError::validation(format!(
                "model '{}' does not support streaming",
                constraints.model
            )));
        }

        let mut eligible: Vec<&Arc<ProviderProfile>> = capable
            .into_iter()
            .filter(|p| !constraints.stream || p.supports_streaming)
            .filter(|p| {
                let available = self.health.is_available(&p.id);
                if !available {
                    debug!("Skipping provider '{}': circuit open", p.id);
                }
                available
            })
            .collect();
        if eligible.is_empty() {
            return Err(GatewayError::AllProvidersExhausted {
                model: constraints.model.clone(),
            });
        }

        self.order(&mut eligible, strategy);
        let (mut eligible, saturated): (Vec<_>, Vec<_>) = eligible.into_iter().partition(|p| {
            self.limiter
                .peek(&Scope::provider(p.id.as_str()), constraints.units)
        });
        for p in &saturated {
            debug!("Deferring provider '{}': rate limit window full", p.id);
        }
        eligible.extend(saturated);
        debug!(
            "Routing '{}' via {}: [{}]",
            constraints.model,
            strategy,
            eligible
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(eligible
            .into_iter()
            .map(|p| Candidate {
                provider: Arc::clone(p),
                upstream_model: p.upstream_model(&constraints.model),
            })
            .collect())
    }

    fn order(&self, eligible: &mut Vec<&Arc<ProviderProfile>>, strategy: Strategy) {
        match strategy {
            Strategy::FallbackChain => {}
            Strategy::Cheapest => {
                eligible.sort_by(|a, b| a.cost_per_1k_tokens.total_cmp(&b.cost_per_1k_tokens));
            }
            Strategy::Fastest => {
                eligible.sort_by(|a, b| self.latency(&a.id).total_cmp(&self.latency(&b.id)));
            }
            Strategy::Balanced => {
                let max_cost = eligible
                    .iter()
                    .map(|p| p.cost_per_1k_tokens)
                    .fold(0.0_f64, f64::max);
                let max_latency = eligible
                    .iter()
                    .map(|p| self.latency(&p.id))
                    .fold(0.0_f64, f64::max);
                let mut scored: Vec<(f64, &Arc<ProviderProfile>)> = eligible
                    .iter()
                    .map(|p| (self.balanced_score(p, max_cost, max_latency), *p))
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                *eligible = scored.into_iter().map(|(_, p)| p).collect();
            }
            Strategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible.rotate_left(start);
            }
        }
    }

    /// Lower is better
    fn balanced_score(&self, provider: &ProviderProfile, max_cost: f64, max_latency: f64) -> f64 {
        let cost = ratio(provider.cost_per_1k_tokens, max_cost);
        let latency = ratio(self.latency(&provider.id), max_latency);
        let errors = self.health.error_rate(&provider.id);
        self.weights.cost * cost + self.weights.latency * latency + self.weights.health * errors
    }

    /// Unobserved providers count as instant so they get tried
    fn latency(&self, provider_id: &str) -> f64 {
        self.health.ema_latency_ms(provider_id).unwrap_or(0.0)
    }
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 { value / max } else { 0.0 }
}
