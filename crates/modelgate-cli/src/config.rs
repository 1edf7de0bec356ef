use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use modelgate_core::keys::mask_secret;
use modelgate_core::router::BalancedWeights;
use modelgate_core::{
    AuthScheme, HealthConfig, KeyManagerConfig, LimitType, ProviderProfile, Strategy, WireFormat,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
}

// ── [server] ──

#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub admin_token: String,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("admin_token", &mask_secret(&self.admin_token))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            admin_token: String::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

// ── [gateway] ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub balanced_weights: WeightsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            balanced_weights: WeightsConfig::default(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_request_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsConfig {
    pub cost: f64,
    pub latency: f64,
    pub health: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let w = BalancedWeights::default();
        Self {
            cost: w.cost,
            latency: w.latency,
            health: w.health,
        }
    }
}

impl From<&WeightsConfig> for BalancedWeights {
    fn from(w: &WeightsConfig) -> Self {
        Self {
            cost: w.cost,
            latency: w.latency,
            health: w.health,
        }
    }
}

// ── [keys] ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStoreKind {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub store: KeyStoreKind,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_degradation_secs")]
    pub degradation_secs: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_usage_window_secs")]
    pub usage_window_secs: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            store: KeyStoreKind::default(),
            sqlite_path: default_sqlite_path(),
            degradation_secs: default_degradation_secs(),
            cache_ttl_ms: default_cache_ttl_ms(),
            usage_window_secs: default_usage_window_secs(),
        }
    }
}

fn default_sqlite_path() -> String {
    "~/.modelgate/keys.db".to_string()
}

fn default_degradation_secs() -> u64 {
    900
}

fn default_cache_ttl_ms() -> u64 {
    500
}

fn default_usage_window_secs() -> u64 {
    60
}

impl KeysConfig {
    pub fn manager_config(&self) -> KeyManagerConfig {
        KeyManagerConfig {
            degradation_period: Duration::from_secs(self.degradation_secs),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            usage_window: Duration::from_secs(self.usage_window_secs.max(1)),
            ..KeyManagerConfig::default()
        }
    }
}

// ── [health] ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

fn default_ema_alpha() -> f64 {
    0.3
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_cooldown_secs() -> u64 {
    600
}

impl From<&HealthSection> for HealthConfig {
    fn from(h: &HealthSection) -> Self {
        Self {
            ema_alpha: h.ema_alpha,
            failure_threshold: h.failure_threshold.max(1),
            cooldown: Duration::from_secs(h.cooldown_secs),
            max_cooldown: Duration::from_secs(h.max_cooldown_secs.max(h.cooldown_secs)),
        }
    }
}

// ── [[providers]] ──

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub wire_format: WireFormat,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthScheme,
    pub models: Vec<String>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_supports_streaming")]
    pub supports_streaming: bool,
    /// Secrets registered with the key manager at startup
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(|k| mask_secret(k)).collect();
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("wire_format", &self.wire_format)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("models", &self.models)
            .field("model_aliases", &self.model_aliases)
            .field("cost_per_1k_tokens", &self.cost_per_1k_tokens)
            .field("supports_streaming", &self.supports_streaming)
            .field("keys", &keys)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_supports_streaming() -> bool {
    true
}

fn default_provider_timeout_secs() -> u64 {
    120
}

impl ProviderConfig {
    pub fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            id: self.id.clone(),
            wire_format: self.wire_format,
            models: self.models.clone(),
            model_aliases: self.model_aliases.clone(),
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            supports_streaming: self.supports_streaming,
        }
    }
}

// ── [[rate_limits]] ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub provider: String,
    /// Display prefix of one key (as shown by the admin API), or `*` for
    /// every key separately. Absent limits the provider as a whole.
    #[serde(default)]
    pub key: Option<String>,
    pub limit_type: LimitType,
    pub limit: u64,
    #[serde(default)]
    pub burst: u64,
    /// Defaults to the limit type's natural window
    #[serde(default)]
    pub window_secs: Option<u64>,
}

// ── Loading ──

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelgate")
}

/// `~/` prefix → home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

impl ModelgateConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // The file may carry secrets
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    bail!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    );
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `modelgate init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        for (provider, key) in hardcoded_keys(&content) {
            warn!(
                "Key {} for provider '{}' is hardcoded in the config file. Use an environment variable instead: keys = [\"${{{}_API_KEY}}\"]",
                mask_secret(&key),
                provider,
                provider.to_uppercase()
            );
        }

        Ok(config)
    }

    /// Expand allowed environment variables, parse and validate
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                bail!("provider id must not be empty");
            }
            if !seen.insert(provider.id.as_str()) {
                bail!("duplicate provider id '{}'", provider.id);
            }
            if provider.models.is_empty() && provider.model_aliases.is_empty() {
                bail!("provider '{}' serves no models", provider.id);
            }
        }
        for limit in &self.rate_limits {
            if !seen.contains(limit.provider.as_str()) {
                bail!("rate limit refers to unknown provider '{}'", limit.provider);
            }
        }
        if self.gateway.max_attempts == 0 {
            bail!("gateway.max_attempts must be at least 1");
        }
        Ok(())
    }
}

/// Provider keys written literally rather than as `${VAR}` references
fn hardcoded_keys(raw: &str) -> Vec<(String, String)> {
    let Ok(config) = toml::from_str::<ModelgateConfig>(raw) else {
        return Vec::new();
    };
    config
        .providers
        .into_iter()
        .flat_map(|p| {
            let id = p.id;
            p.keys
                .into_iter()
                .filter(|k| !k.is_empty() && !k.contains("${"))
                .map(move |k| (id.clone(), k))
        })
        .collect()
}

/// Only credential-like variables are expanded, so a config file cannot be
/// used to read arbitrary environment
fn is_expandable(name: &str) -> bool {
    name.ends_with("_API_KEY") || name.starts_with("MODELGATE_")
}

fn expand_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + len];
        result.push_str(&rest[..start]);
        if is_expandable(name) {
            result.push_str(&std::env::var(name).unwrap_or_default());
        } else {
            warn!(
                "Skipping expansion of env var '{}' in config (only *_API_KEY and MODELGATE_* are expanded)",
                name
            );
            result.push_str(&rest[start..=start + len]);
        }
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}
