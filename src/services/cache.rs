//! Read-model cache shared with the API layer.
//!
//! The worker only writes to the cache indirectly: after a practitioner is
//! synced, every key derived from that practitioner is invalidated so readers
//! rebuild from the database.

use crate::error::{AppError, Result};
use crate::services::connect_redis;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 200;

#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete every key matching a glob pattern. Returns the number removed.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64>;

    async fn is_connected(&self) -> bool;
}

/// Cache key patterns derived from one practitioner.
pub fn practitioner_patterns(practitioner_id: i64) -> [String; 4] {
    [
        format!("practitioner:{}*", practitioner_id),
        format!("sessions:{}:*", practitioner_id),
        format!("availability:{}:*", practitioner_id),
        format!("clients:{}:*", practitioner_id),
    ]
}

/// Invalidate everything cached for a practitioner, logging failures.
pub async fn invalidate_practitioner(cache: &dyn CacheService, practitioner_id: i64) {
    let mut removed = 0;
    for pattern in practitioner_patterns(practitioner_id) {
        match cache.invalidate_pattern(&pattern).await {
            Ok(n) => removed += n,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Cache invalidation failed");
            }
        }
    }
    if removed > 0 {
        tracing::debug!(practitioner_id, removed, "Invalidated cached keys");
    }
}

/// Build the cache from configuration, degrading to [`NoopCache`].
pub async fn connect_cache(url: Option<&str>, namespace: &str) -> Arc<dyn CacheService> {
    let Some(url) = url else {
        return Arc::new(NoopCache);
    };
    match connect_redis(url).await {
        Ok(conn) => {
            tracing::info!(namespace, "Cache connected");
            Arc::new(RedisCache::new(conn, namespace))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cache unavailable, continuing without it");
            Arc::new(NoopCache)
        }
    }
}

/// Redis-backed cache with namespaced keys.
pub struct RedisCache {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            namespace: namespace.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

fn cache_err(e: redis::RedisError) -> AppError {
    AppError::Cache(e.to_string())
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.key(key)).await.map_err(cache_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.key(key), value, ttl.as_secs().max(1))
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = self.key(pattern);
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(cache_err)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(cache_err)?;
                removed += deleted;
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn is_connected(&self) -> bool {
        ping(&self.conn).await
    }
}

pub(crate) async fn ping(conn: &ConnectionManager) -> bool {
    let mut conn = conn.clone();
    let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
    pong.is_ok()
}

/// Cache used when Redis is not configured.
pub struct NoopCache;

#[async_trait]
impl CacheService for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn invalidate_pattern(&self, _pattern: &str) -> Result<u64> {
        Ok(0)
    }

    async fn is_connected(&self) -> bool {
        false
    }
}
