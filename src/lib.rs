// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Practice-Sync: keeps a local practice database in step with a FHIR
//! practice-management system.
//!
//! This crate provides the background worker that pulls practitioners,
//! clients, appointments and availability over FHIR and upserts them into
//! the local store, plus its health endpoints.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod time_utils;

use db::SyncStore;
use runtime::WorkerState;
use services::{BroadcastService, CacheService, QueueService};
use std::sync::Arc;

/// Shared state for the health server.
pub struct AppState {
    pub worker: Arc<WorkerState>,
    pub store: Arc<dyn SyncStore>,
    pub cache: Arc<dyn CacheService>,
    pub broadcast: Arc<dyn BroadcastService>,
    pub queue: Arc<dyn QueueService>,
}
