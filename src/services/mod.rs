// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod broadcast;
pub mod cache;
pub mod fhir;
pub mod practice_api;
pub mod queue;
pub mod rate_limit;
pub mod sync;
pub mod token;

pub use broadcast::{BroadcastEvent, BroadcastService};
pub use cache::CacheService;
pub use practice_api::{FhirClient, PracticeApi};
pub use queue::{MessageHandler, QueueMessage, QueueService, SyncRequest};
pub use rate_limit::RateLimiter;
pub use sync::{FullSync, SyncOrchestrator};
pub use token::TokenManager;

use redis::aio::ConnectionManager;
use std::time::Duration;

/// Upper bound on establishing a Redis connection at startup.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a managed Redis connection, failing fast if the server is unreachable.
pub(crate) async fn connect_redis(url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = tokio::time::timeout(REDIS_CONNECT_TIMEOUT, client.get_connection_manager())
        .await
        .map_err(|_| anyhow::anyhow!("timed out connecting to Redis"))??;
    Ok(conn)
}
