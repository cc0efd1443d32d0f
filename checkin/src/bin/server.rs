//! Gate check-in HTTP server.
//!
//! Serves the session API to gate clients. Uses the `PostgreSQL` backend
//! when `DATABASE_URL` is set and the `postgres` feature is enabled,
//! otherwise in-memory ports seeded with demo data.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! DATABASE_URL=postgres://localhost/checkin cargo run --features postgres --bin server
//! ```

use anyhow::Context;
use gatekeeper_checkin::metrics::MetricsServer;
use gatekeeper_checkin::server::{AppState, build_router};
use gatekeeper_checkin::{Config, EventRegistry, InMemoryBackend, ValidationPipeline};
use gatekeeper_core::environment::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},tower_http=info,sqlx=warn", config.server.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gate check-in server");

    let mut metrics = MetricsServer::new(
        config
            .metrics_address()
            .parse()
            .context("Invalid metrics address")?,
    );
    metrics.start()?;
    let (metrics_addr, _metrics_task) = metrics.serve().await?;
    tracing::info!(addr = %metrics_addr, "Metrics listening");

    let (registry, pipeline) = build_backend(&config).await?;
    let mut state = AppState::new(registry, pipeline, config.checkin.session());
    if let Some(handle) = metrics.handle() {
        state = state.with_metrics(handle.clone());
    }

    let sweeper = {
        let state = state.clone();
        let max_idle = config.checkin.session_idle();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(max_idle.clamp(Duration::from_secs(1), Duration::from_secs(60)));
            loop {
                ticks.tick().await;
                let removed = state.sweep_sessions(max_idle).await;
                if removed > 0 {
                    tracing::info!(removed, "Swept stale sessions");
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
    tracing::info!(addr = %config.bind_address(), "Listening");

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down gracefully...");
        })
        .await?;
    sweeper.abort();

    let sessions: Vec<_> = state.sessions.write().await.drain().map(|(_, s)| s).collect();
    for session in sessions {
        match session.end().await {
            Ok(tally) => tracing::info!(
                session = %session.id(),
                valid = tally.valid_count(),
                invalid = tally.invalid_count(),
                "Closed session on shutdown"
            ),
            Err(error) => tracing::warn!(session = %session.id(), %error, "Session close failed"),
        }
    }

    Ok(())
}

type Backend = (Arc<dyn EventRegistry>, Arc<ValidationPipeline>);

#[cfg(feature = "postgres")]
async fn build_backend(config: &Config) -> anyhow::Result<Backend> {
    let Some(postgres) = &config.postgres else {
        return Ok(in_memory(config));
    };

    let backend = gatekeeper_checkin::postgres::PostgresBackend::connect(
        &postgres.url,
        postgres.max_connections,
    )
    .await
    .context("Failed to connect to PostgreSQL")?;
    backend.migrate().await?;
    tracing::info!("Using PostgreSQL backend");

    let backend = Arc::new(backend);
    let pipeline = ValidationPipeline::new(
        backend.clone(),
        backend.clone(),
        Arc::new(SystemClock),
        config.checkin.store_timeout(),
    );
    let registry: Arc<dyn EventRegistry> = backend;
    Ok((registry, Arc::new(pipeline)))
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)] // Same signature as the postgres variant
async fn build_backend(config: &Config) -> anyhow::Result<Backend> {
    if config.postgres.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled");
    }
    Ok(in_memory(config))
}

fn in_memory(config: &Config) -> Backend {
    tracing::info!("Using in-memory backend with demo data");
    let backend = InMemoryBackend::seeded();
    let pipeline = ValidationPipeline::new(
        backend.tickets.clone(),
        backend.ledger.clone(),
        Arc::new(SystemClock),
        config.checkin.store_timeout(),
    );
    let registry: Arc<dyn EventRegistry> = backend.events;
    (registry, Arc::new(pipeline))
}
