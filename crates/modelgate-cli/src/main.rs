use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use modelgate_core::keys::mask_secret;
use modelgate_core::rate_limit::EACH_KEY;
use modelgate_core::{
    HealthTracker, HttpUpstream, KeyManager, KeyStore, KeyView, MemoryKeyStore, RateLimitSpec,
    RateLimiter, Router, SqliteKeyStore, UpstreamRegistry,
};
use modelgate_gateway::{GatewayServer, GatewaySettings, GatewayState};

mod config;

use config::{KeyStoreKind, ModelgateConfig, RateLimitConfig};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(version)]
#[command(about = "modelgate: one endpoint in front of many LLM providers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration, secrets masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match std::env::var("RUST_LOG") {
        Ok(f) if !f.is_empty() => f,
        _ if cli.debug => "debug".to_string(),
        _ => "info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("modelgate initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure providers, then export their *_API_KEY variables.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ModelgateConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&redacted(cfg))?);
    Ok(())
}

fn redacted(mut cfg: ModelgateConfig) -> ModelgateConfig {
    if !cfg.server.admin_token.is_empty() {
        cfg.server.admin_token = mask_secret(&cfg.server.admin_token);
    }
    for provider in &mut cfg.providers {
        for key in &mut provider.keys {
            *key = mask_secret(key);
        }
    }
    cfg
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ModelgateConfig::load(config_path)?;
    info!("Starting modelgate...");

    let cancel = CancellationToken::new();

    // Key store
    let store: Arc<dyn KeyStore> = match cfg.keys.store {
        KeyStoreKind::Memory => {
            warn!("Using the in-memory key store; usage and key state are lost on restart");
            Arc::new(MemoryKeyStore::new())
        }
        KeyStoreKind::Sqlite => {
            let path = config::expand_home(&cfg.keys.sqlite_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteKeyStore::open(&path)
                .with_context(|| format!("Failed to open key store at {}", path.display()))?;
            info!("Key store opened at {}", path.display());
            Arc::new(store)
        }
    };

    let limiter = Arc::new(RateLimiter::new(Vec::new()));
    let keys = Arc::new(KeyManager::new(
        store,
        limiter.clone(),
        cfg.keys.manager_config(),
    ));

    for provider in &cfg.providers {
        let mut registered = 0usize;
        for secret in &provider.keys {
            if secret.trim().is_empty() || secret.contains("${") {
                warn!(
                    "Skipping unset key for provider '{}' (is its environment variable exported?)",
                    provider.id
                );
                continue;
            }
            keys.add_key(&provider.id, secret)
                .await
                .with_context(|| format!("Failed to register key for '{}'", provider.id))?;
            registered += 1;
        }
        if registered == 0 {
            let stored = keys.list_keys(Some(&provider.id)).await?;
            if stored.is_empty() {
                warn!(
                    "Provider '{}' has no keys; requests routed to it will fail until one is added",
                    provider.id
                );
            }
        }
    }

    let known_keys = keys.list_keys(None).await?;
    let specs = rate_limit_specs(&cfg.rate_limits, &known_keys);
    info!("{} rate limit(s) active", specs.len());
    limiter.update_specs(specs);

    // Routing
    let health = Arc::new(HealthTracker::new((&cfg.health).into()));
    let router = Arc::new(
        Router::new(
            cfg.providers.iter().map(|p| p.profile()).collect(),
            health.clone(),
            limiter.clone(),
        )
        .with_weights((&cfg.gateway.balanced_weights).into()),
    );

    let mut upstreams = UpstreamRegistry::new();
    for provider in &cfg.providers {
        let client = HttpUpstream::new(
            provider.id.clone(),
            provider.wire_format,
            provider.base_url.clone(),
            provider.auth,
            Duration::from_secs(provider.timeout_secs),
        )?;
        upstreams.register(Arc::new(client));
        info!(
            "Provider '{}' ({}) at {}",
            provider.id, provider.wire_format, provider.base_url
        );
    }

    // An unexpanded reference is not a usable token
    let admin_token = if cfg.server.admin_token.contains("${") {
        String::new()
    } else {
        cfg.server.admin_token.clone()
    };
    if admin_token.is_empty() {
        warn!("No admin token configured; the admin API is disabled");
    }
    let settings = GatewaySettings {
        strategy: cfg.gateway.strategy,
        max_attempts: cfg.gateway.max_attempts,
        request_timeout: Duration::from_secs(cfg.gateway.request_timeout_secs),
        admin_token,
    };
    info!("Routing strategy: {}", settings.strategy);

    let state = GatewayState::new(keys, limiter, health, router, upstreams, settings)
        .with_shutdown(cancel.clone());

    let bind: SocketAddr = format!("{}:{}", cfg.server.bind, cfg.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid bind address {}:{}",
                cfg.server.bind, cfg.server.port
            )
        })?;
    let server = GatewayServer::new(bind, state).spawn();

    info!("modelgate is running. Press Ctrl+C to stop.");

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Gateway server error: {}", e),
        Err(e) => error!("Gateway server task panicked: {}", e),
    }

    info!("modelgate stopped");
    Ok(())
}

/// Turn configured limits into limiter specs. A limit naming a single key
/// matches it by id or by its masked display prefix.
fn rate_limit_specs(limits: &[RateLimitConfig], keys: &[KeyView]) -> Vec<RateLimitSpec> {
    let mut specs = Vec::with_capacity(limits.len());
    for limit in limits {
        let mut spec = RateLimitSpec::new(limit.provider.clone(), limit.limit_type, limit.limit)
            .with_burst(limit.burst);
        if let Some(secs) = limit.window_secs {
            spec = spec.with_window(Duration::from_secs(secs));
        }
        match limit.key.as_deref() {
            None => {}
            Some(EACH_KEY) => spec = spec.for_key(EACH_KEY),
            Some(wanted) => {
                let Some(key) = keys
                    .iter()
                    .find(|k| k.provider_id == limit.provider && (k.id == wanted || k.prefix == wanted))
                else {
                    warn!(
                        "Rate limit for provider '{}' names unknown key '{}'; skipping",
                        limit.provider, wanted
                    );
                    continue;
                };
                spec = spec.for_key(key.id.clone());
            }
        }
        specs.push(spec);
    }
    specs
}
