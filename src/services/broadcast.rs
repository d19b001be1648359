//! Real-time sync notifications over Redis pub/sub.

use crate::error::{AppError, Result};
use crate::models::{PractitionerRef, SyncResult};
use crate::services::cache::ping;
use crate::services::connect_redis;
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::sync::Arc;

pub const SYNC_COMPLETED: &str = "sync.completed";
pub const SYNC_FAILED: &str = "sync.failed";

/// Event published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: format_utc_rfc3339(Utc::now()),
            data,
        }
    }

    /// Event describing the outcome of one practitioner pass.
    pub fn for_sync(practitioner: &PractitionerRef, result: &SyncResult) -> Self {
        let event_type = if result.success {
            SYNC_COMPLETED
        } else {
            SYNC_FAILED
        };
        Self::new(
            event_type,
            serde_json::json!({
                "practitionerId": practitioner.id,
                "practitionerExternalId": practitioner.external_id,
                "created": result.created,
                "updated": result.updated,
                "deleted": result.deleted,
                "errorCount": result.errors.len(),
                "durationMs": result.duration_ms,
            }),
        )
    }
}

#[async_trait]
pub trait BroadcastService: Send + Sync {
    async fn publish(&self, event: &BroadcastEvent) -> Result<()>;

    async fn is_connected(&self) -> bool;
}

/// Build the broadcaster from configuration, degrading to [`NoopBroadcast`].
pub async fn connect_broadcast(url: Option<&str>, namespace: &str) -> Arc<dyn BroadcastService> {
    let Some(url) = url else {
        return Arc::new(NoopBroadcast);
    };
    match connect_redis(url).await {
        Ok(conn) => {
            let channel = format!("{}:events", namespace);
            tracing::info!(channel = %channel, "Broadcast connected");
            Arc::new(RedisBroadcast { conn, channel })
        }
        Err(e) => {
            tracing::warn!(error = %e, "Broadcast unavailable, continuing without it");
            Arc::new(NoopBroadcast)
        }
    }
}

pub struct RedisBroadcast {
    conn: ConnectionManager,
    channel: String,
}

#[async_trait]
impl BroadcastService for RedisBroadcast {
    async fn publish(&self, event: &BroadcastEvent) -> Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| AppError::Broadcast(format!("Failed to encode event: {}", e)))?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| AppError::Broadcast(e.to_string()))?;
        tracing::debug!(event_type = %event.event_type, receivers, "Published event");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        ping(&self.conn).await
    }
}

pub struct NoopBroadcast;

#[async_trait]
impl BroadcastService for NoopBroadcast {
    async fn publish(&self, _event: &BroadcastEvent) -> Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    fn practitioner() -> PractitionerRef {
        PractitionerRef {
            id: 7,
            external_id: "dr-7".to_string(),
            name: "Dr. Seven".to_string(),
        }
    }

    #[test]
    fn event_type_follows_result() {
        let mut result = SyncResult {
            success: true,
            created: 2,
            ..Default::default()
        };
        let event = BroadcastEvent::for_sync(&practitioner(), &result);
        assert_eq!(event.event_type, SYNC_COMPLETED);
        assert_eq!(event.data["practitionerId"], 7);
        assert_eq!(event.data["created"], 2);

        result.record_error(EntityType::Client, "p1", "bad");
        result.success = false;
        let event = BroadcastEvent::for_sync(&practitioner(), &result);
        assert_eq!(event.event_type, SYNC_FAILED);
        assert_eq!(event.data["errorCount"], 1);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = BroadcastEvent::new(SYNC_COMPLETED, serde_json::json!({}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sync.completed");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
