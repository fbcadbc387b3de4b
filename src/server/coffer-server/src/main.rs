//! Coffer Server - Main entry point.

mod bootstrap;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coffer_api::{ApiSettings, AppState};
use coffer_auth::JwtConfig;
use coffer_crypto::{random, RootKey};
use coffer_storage::{MemoryBackend, StorageBackend};
use coffer_storage_sqlite::SqliteBackend;

use crate::config::{Cli, Config, LogFormat};

const DEFAULT_LOG_FILTER: &str = "info,coffer=debug";
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Opens storage and the root key.
///
/// Dev mode keeps everything in memory and generates a throwaway root key.
async fn open_storage(
    config: &Config,
    dev: bool,
) -> anyhow::Result<(Arc<dyn StorageBackend>, SqliteBackend, RootKey)> {
    if dev {
        let sql = SqliteBackend::in_memory().await?;
        let root_key = match &config.security.root_key {
            Some(encoded) => RootKey::from_base64(encoded).context("invalid root key")?,
            None => RootKey::generate(),
        };
        return Ok((Arc::new(MemoryBackend::new()), sql, root_key));
    }

    let Some(encoded) = &config.security.root_key else {
        bail!("a root key is required outside dev mode (--root-key or COFFER_ROOT_KEY)");
    };
    let root_key = RootKey::from_base64(encoded).context("invalid root key")?;
    let sql = SqliteBackend::open(&config.storage.data_dir, "coffer")
        .await
        .with_context(|| format!("failed to open {}", config.storage.data_dir.display()))?;
    Ok((Arc::new(sql.clone()), sql, root_key))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<Option<CorsLayer>> {
    if origins.is_empty() {
        return Ok(None);
    }
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin '{}'", o)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}

/// Revokes expired leases on every tick.
fn spawn_lease_reaper(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match state.dynamic.revoke_expired(coffer_projects::now()).await {
                Ok(0) => {},
                Ok(revoked) => info!(revoked, "Expired leases revoked"),
                Err(e) => error!(error = %e, "Lease reaper failed"),
            }
        }
    });
}

fn spawn_rate_limit_cleanup(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = state.rate_limits.cleanup();
            if removed > 0 {
                debug!(removed, "Idle rate-limit windows dropped");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply(&cli);

    init_tracing(&config);

    info!("Starting Coffer server...");
    info!("Bind address: {}", config.server.bind);

    if cli.dev {
        warn!("Development mode enabled - DO NOT USE IN PRODUCTION");
    }

    let jwt_secret = match (&config.auth.jwt_secret, cli.dev) {
        (Some(secret), _) => secret.clone(),
        (None, true) => random::generate_token(32),
        (None, false) => {
            bail!("a JWT secret is required outside dev mode (--jwt-secret or COFFER_JWT_SECRET)")
        },
    };

    let (storage, sql, root_key) = open_storage(&config, cli.dev).await?;
    let mut settings = ApiSettings::new(JwtConfig {
        secret: jwt_secret,
        issuer: config.auth.jwt_issuer.clone(),
        audience: config.auth.jwt_audience.clone(),
    });
    settings.rate_limits = config.rate_limits;
    if let Some(max_leases) = config.dynamic.max_leases {
        settings.max_leases = max_leases;
    }

    let state = AppState::build(storage, sql, root_key, settings).await?;
    if cli.dev {
        bootstrap::dev(&state, config.dev_token_ttl()?).await?;
    }

    spawn_lease_reaper(state.clone(), config.reaper_interval()?);
    spawn_rate_limit_cleanup(state.clone());

    let mut app = coffer_api::router(state);
    if let Some(cors) = cors_layer(&config.server.cors_origins)? {
        app = app.layer(cors);
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!("Coffer server started successfully");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
