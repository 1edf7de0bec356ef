//! Key selection, usage recording and failure handling
//!
//! Degradation recovers lazily: nothing sweeps expired degradations, they
//! are simply ignored (and cleared) the next time a provider's keys are
//! evaluated.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ApiKey, KeyStore, KeyView};
use crate::error::{FailureKind, GatewayError, Result};
use crate::rate_limit::{RateLimiter, Scope, Units};

#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// How long a key sits out after a transient or rate-limit failure
    pub degradation_period: Duration,
    /// Lifetime of a cached key list
    pub cache_ttl: Duration,
    /// Providers kept in the cache
    pub cache_capacity: usize,
    /// Length of the usage-counter window
    pub usage_window: Duration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            degradation_period: Duration::from_secs(15 * 60),
            cache_ttl: Duration::from_millis(500),
            cache_capacity: 64,
            usage_window: Duration::from_secs(60),
        }
    }
}

struct CachedKeys {
    loaded_at: Instant,
    keys: Vec<ApiKey>,
}

/// Picks the least-used eligible key per provider and keeps its counters
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    limiter: Arc<RateLimiter>,
    config: KeyManagerConfig,
    cache: Mutex<LruCache<String, CachedKeys>>,
    // Serializes read-modify-write per provider so counters never lose updates
    provider_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, limiter: Arc<RateLimiter>, config: KeyManagerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            limiter,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            provider_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_degradation_period(mut self, period: Duration) -> Self {
        self.config.degradation_period = period;
        self
    }

    /// Pick a key for `provider_id` with room for a single request
    pub async fn select_key(&self, provider_id: &str) -> Result<ApiKey> {
        self.select_key_for(provider_id, Units::request(0)).await
    }

    /// Pick the eligible key with the lowest usage score whose rate-limit
    /// window can still take `units`. Ties go to the key unused longest.
    pub async fn select_key_for(&self, provider_id: &str, units: Units) -> Result<ApiKey> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut keys = self.load(provider_id).await?;
        let window = self.config.usage_window;
        for key in &mut keys {
            key.normalize(now, window);
        }

        let chosen = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_eligible(now))
            .filter(|(_, k)| {
                self.limiter
                    .peek(&Scope::key(provider_id, k.id.as_str()), units)
            })
            .min_by(|(_, a), (_, b)| {
                a.usage_score()
                    .total_cmp(&b.usage_score())
                    .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|(i, _)| i);

        let Some(index) = chosen else {
            debug!(
                "No eligible key for provider '{}' ({} known)",
                provider_id,
                keys.len()
            );
            return Err(GatewayError::NoKeyAvailable {
                provider: provider_id.to_string(),
            });
        };

        // Stamps strictly increase within a provider so fairness never
        // depends on clock resolution
        let newest = keys.iter().filter_map(|k| k.last_used_at).max();
        let stamp = match newest {
            Some(newest) if newest >= now => newest + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        keys[index].last_used_at = Some(stamp);
        let key = keys[index].clone();

        self.store.put(&key).await?;
        self.invalidate(provider_id);
        self.remember(provider_id, keys);

        debug!("Selected key {} for provider '{}'", key.prefix, provider_id);
        Ok(key)
    }

    /// Add `tokens_used` and one request to the key's counters
    pub async fn record_success(&self, key_id: &str, tokens_used: u64) -> Result<()> {
        self.update(key_id, |key, _| {
            key.window_requests = key.window_requests.saturating_add(1);
            key.window_tokens = key.window_tokens.saturating_add(tokens_used);
            key.total_requests = key.total_requests.saturating_add(1);
            key.total_tokens = key.total_tokens.saturating_add(tokens_used);
        })
        .await
    }

    /// Auth and account failures deactivate the key; transient and
    /// rate-limit failures park it for the degradation period
    pub async fn record_failure(&self, key_id: &str, kind: FailureKind) -> Result<()> {
        let period = self.config.degradation_period;
        self.update(key_id, |key, now| {
            if kind.deactivates_key() {
                key.active = false;
                warn!(
                    "Deactivated key {} of provider '{}' after {:?} failure",
                    key.prefix, key.provider_id, kind
                );
            } else if kind.degrades_key() {
                let until = now
                    + chrono::Duration::from_std(period).unwrap_or(chrono::Duration::minutes(15));
                key.degraded_until = Some(until);
                warn!(
                    "Degraded key {} of provider '{}' until {} after {:?} failure",
                    key.prefix, key.provider_id, until, kind
                );
            }
        })
        .await
    }

    // ── Admin ──

    pub async fn add_key(&self, provider_id: &str, secret: &str) -> Result<KeyView> {
        if secret.trim().is_empty() {
            return Err(GatewayError::validation("key secret must not be empty"));
        }
        let existing = self.store.list(Some(provider_id)).await?;
        if let Some(dup) = existing.iter().find(|k| k.secret == secret) {
            debug!("Key {} already registered for '{}'", dup.prefix, provider_id);
            return Ok(dup.view(Utc::now()));
        }

        let key = ApiKey::new(provider_id, secret);
        self.store.put(&key).await?;
        self.invalidate(provider_id);
        info!("Added key {} for provider '{}'", key.prefix, provider_id);
        Ok(key.view(Utc::now()))
    }

    /// Take a key out of rotation; records are kept for their history
    pub async fn deactivate(&self, key_id: &str) -> Result<KeyView> {
        self.update(key_id, |key, _| key.active = false).await?;
        let key = self.get(key_id).await?;
        info!("Deactivated key {} on request", key.prefix);
        Ok(key.view(Utc::now()))
    }

    pub async fn list_keys(&self, provider_id: Option<&str>) -> Result<Vec<KeyView>> {
        let now = Utc::now();
        let keys = match provider_id {
            Some(p) => self.load(p).await?,
            None => self.store.list(None).await?,
        };
        Ok(keys.iter().map(|k| k.view(now)).collect())
    }

    // ── Internals ──

    async fn get(&self, key_id: &str) -> Result<ApiKey> {
        self.store
            .get(key_id)
            .await?
            .ok_or_else(|| GatewayError::validation(format!("unknown key '{}'", key_id)))
    }

    async fn update<F>(&self, key_id: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ApiKey, DateTime<Utc>),
    {
        let provider_id = self.get(key_id).await?.provider_id;
        let lock = self.provider_lock(&provider_id);
        let _guard = lock.lock().await;

        // Re-read under the lock
        let mut key = self.get(key_id).await?;
        let now = Utc::now();
        key.normalize(now, self.config.usage_window);
        mutate(&mut key, now);
        self.store.put(&key).await?;
        self.invalidate(&provider_id);
        Ok(())
    }

    /// Read-through: cached list if still fresh, else the store
    async fn load(&self, provider_id: &str) -> Result<Vec<ApiKey>> {
        {
            let mut cache = self.lock_cache();
            if let Some(entry) = cache.get(provider_id) {
                if entry.loaded_at.elapsed() < self.config.cache_ttl {
                    return Ok(entry.keys.clone());
                }
            }
        }
        let keys = self.store.list(Some(provider_id)).await?;
        self.remember(provider_id, keys.clone());
        Ok(keys)
    }

    fn remember(&self, provider_id: &str, keys: Vec<ApiKey>) {
        self.lock_cache().put(
            provider_id.to_string(),
            CachedKeys {
                loaded_at: Instant::now(),
                keys,
            },
        );
    }

    fn invalidate(&self, provider_id: &str) {
        self.lock_cache().pop(provider_id);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, CachedKeys>> {
        self.cache.lock().unwrap_or_else(|poisoned| {
            warn!("Key cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn provider_lock(&self, provider_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.provider_locks.lock().unwrap_or_else(|poisoned| {
            warn!("Key lock table was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(locks.entry(provider_id.to_string()).or_default())
    }
}
