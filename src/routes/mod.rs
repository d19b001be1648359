// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Health, readiness and metrics endpoints.

use crate::runtime::LastSync;
use crate::AppState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

const CONNECTED: &str = "connected";
const NOT_CONNECTED: &str = "not connected";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(feature = "binding-generation", ts(export, export_to = "bindings/"))]
pub struct ServiceConnectivity {
    pub database: String,
    pub cache: String,
    pub broadcast: String,
    pub queue: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(feature = "binding-generation", ts(export, export_to = "bindings/"))]
pub struct HealthResponse {
    pub status: String,
    pub last_sync: Option<LastSync>,
    pub sync_count: u64,
    pub error_count: u64,
    pub service_connectivity: ServiceConnectivity,
}

fn connectivity(connected: bool) -> String {
    let label = if connected { CONNECTED } else { NOT_CONNECTED };
    label.to_string()
}

/// Health check response
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let worker = &state.worker;

    let (database, cache, broadcast, queue) = tokio::join!(
        state.store.ping(),
        state.cache.is_connected(),
        state.broadcast.is_connected(),
        state.queue.is_connected(),
    );

    let (code, status) = if worker.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else if worker.is_syncing() {
        (StatusCode::OK, "syncing")
    } else {
        (StatusCode::OK, "ok")
    };

    let body = HealthResponse {
        status: status.to_string(),
        last_sync: worker.last_sync().await,
        sync_count: worker.sync_count(),
        error_count: worker.error_count(),
        service_connectivity: ServiceConnectivity {
            database: connectivity(database.is_ok()),
            cache: connectivity(cache),
            broadcast: connectivity(broadcast),
            queue: connectivity(queue),
        },
    };

    (code, Json(body))
}

/// Ready when idle and not shutting down.
async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let worker = &state.worker;
    let ready = !worker.is_shutting_down() && !worker.is_syncing();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(serde_json::json!({ "ready": ready })))
}

/// Prometheus text exposition of the worker counters.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = state.worker.metrics();
    match metrics.render(state.worker.uptime().as_secs_f64()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, metrics.content_type())],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                "failed to encode metrics".to_string(),
            )
        }
    }
}

/// Build the health router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/metrics", get(metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}
