// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Practice-Sync worker
//!
//! Periodically pulls practitioners, clients, appointments and availability
//! from the practice-management API into the local database, and serves
//! health endpoints while it runs.

use anyhow::Context;
use practice_sync::{
    config::Config,
    db::{SqliteStore, SyncStore},
    runtime::{
        spawn_startup_trigger, trigger_channel, SyncRuntime, SyncScheduler, TriggerHandler,
        WorkerState,
    },
    services::{
        broadcast::connect_broadcast, cache::connect_cache, queue::connect_queue, FhirClient,
        RateLimiter, SyncOrchestrator, TokenManager,
    },
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to wait for background listeners after the grace period.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging
    init_logging();

    // Load configuration from environment; any problem is fatal here
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        port = config.health_port,
        schedule = %config.sync_schedule,
        timezone = %config.sync_timezone,
        "Starting Practice-Sync worker"
    );

    // Local database
    let store = SqliteStore::connect(&config.database_url, config.database_pool_size)
        .context("Failed to open database")?;
    store
        .ensure_schema()
        .await
        .context("Failed to prepare database schema")?;
    let store: Arc<dyn SyncStore> = Arc::new(store);

    // Practice-management API client
    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let tokens = Arc::new(TokenManager::from_config(http.clone(), &config));
    let api = Arc::new(FhirClient::new(
        http,
        config.api_base_url.clone(),
        tokens,
        RateLimiter::per_minute(config.api_rate_limit),
    ));
    let orchestrator = Arc::new(SyncOrchestrator::new(
        api,
        store.clone(),
        config.lookback_days,
        config.lookahead_days,
    ));

    // Optional real-time infrastructure; each degrades to a no-op
    let cache = connect_cache(config.redis_url.as_deref(), &config.cache_namespace).await;
    let broadcast =
        connect_broadcast(config.broadcast_redis_url.as_deref(), &config.cache_namespace).await;
    let queue = connect_queue(config.queue_redis_url.as_deref(), &config.queue_name).await;

    // Runtime and trigger sources
    let worker = Arc::new(WorkerState::new()?);
    let runtime = Arc::new(SyncRuntime::new(
        worker.clone(),
        orchestrator,
        cache.clone(),
        broadcast.clone(),
    ));

    let cancel = CancellationToken::new();
    let (triggers, trigger_rx) = trigger_channel();
    let trigger_loop = tokio::spawn(runtime.clone().run_triggers(trigger_rx, cancel.clone()));

    let mut scheduler =
        SyncScheduler::new(&config.sync_schedule, config.sync_timezone, triggers.clone()).await?;
    scheduler.start().await?;

    if config.run_on_startup {
        spawn_startup_trigger(triggers.clone(), config.startup_delay, cancel.clone());
    }

    let queue_listener = queue.start(
        Arc::new(TriggerHandler::new(triggers.clone())),
        cancel.clone(),
    );
    drop(triggers);

    // Health server
    let state = Arc::new(AppState {
        worker: worker.clone(),
        store,
        cache,
        broadcast,
        queue,
    });
    let app = practice_sync::routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Health server listening");

    let server_stop = CancellationToken::new();
    let server = tokio::spawn({
        let stop = server_stop.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }
    });

    shutdown_signal().await;

    // Stop accepting triggers, then give a running pass the grace period
    tracing::info!("Shutdown requested");
    worker.begin_shutdown();
    if let Err(e) = scheduler.stop().await {
        tracing::warn!(error = %e, "Failed to stop scheduler cleanly");
    }
    cancel.cancel();

    if runtime.wait_idle(config.shutdown_grace).await {
        tracing::info!("Worker idle, exiting");
    } else {
        tracing::warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Sync still running after grace period, exiting anyway"
        );
    }

    if let Some(handle) = queue_listener {
        if tokio::time::timeout(LISTENER_JOIN_TIMEOUT, handle).await.is_err() {
            tracing::warn!("Queue listener did not stop in time, in-flight message stays queued");
        }
    }
    let _ = tokio::time::timeout(LISTENER_JOIN_TIMEOUT, trigger_loop).await;

    server_stop.cancel();
    server.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize structured JSON logging.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("practice_sync=debug,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}
