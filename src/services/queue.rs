// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Out-of-band sync requests delivered through a Redis list.
//!
//! Producers `LPUSH` messages onto the queue. The worker moves the oldest item
//! onto `<queue>:processing` with `LMOVE` and only removes it from there once
//! the message has been completed, re-queued or dead-lettered, so a message
//! in flight when the process stops is picked up again on the next start.
//!
//! Items are wrapped in a delivery envelope so failed messages can be
//! re-queued a bounded number of times before they are dead-lettered. A
//! message that could not run because the worker was busy is re-queued
//! without spending a delivery.

use crate::error::{AppError, Result};
use crate::services::cache::ping;
use crate::services::connect_redis;
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Deliveries allowed before a failing message is dead-lettered.
pub const MAX_DELIVERY_COUNT: u32 = 5;

/// Idle delay between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wait before redelivering a deferred message, and the first retry backoff.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const SYNC_REQUESTED: &str = "sync.requested";
pub const PRACTITIONER_SYNC_REQUESTED: &str = "practitioner.sync.requested";
pub const DIRECTORY_SYNC_REQUESTED: &str = "directory.sync.requested";
pub const ENTITY_CHANGED: &str = "entity.changed";

pub const REASON_MALFORMED: &str = "MalformedMessage";
pub const REASON_MAX_DELIVERY: &str = "MaxDeliveryCountExceeded";

/// Message body as published by other services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub action: Option<String>,
}

/// What a valid message asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    All,
    Practitioner(String),
    Directory,
}

impl QueueMessage {
    /// Validate the message and map it to a sync request.
    pub fn request(&self) -> std::result::Result<SyncRequest, String> {
        let payload = || {
            self.payload
                .as_ref()
                .filter(|p| !p.entity_id.trim().is_empty())
                .ok_or_else(|| format!("{} requires a payload with an entityId", self.message_type))
        };

        match self.message_type.as_str() {
            SYNC_REQUESTED => Ok(SyncRequest::All),
            DIRECTORY_SYNC_REQUESTED => Ok(SyncRequest::Directory),
            PRACTITIONER_SYNC_REQUESTED => {
                Ok(SyncRequest::Practitioner(payload()?.entity_id.clone()))
            }
            ENTITY_CHANGED => {
                let payload = payload()?;
                if payload.entity_type.eq_ignore_ascii_case("practitioner") {
                    Ok(SyncRequest::Practitioner(payload.entity_id.clone()))
                } else {
                    Ok(SyncRequest::All)
                }
            }
            other => Err(format!("Unknown message type: {}", other)),
        }
    }
}

/// Delivery wrapper stored on the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub delivery_count: u32,
    pub body: serde_json::Value,
}

impl Envelope {
    /// Decode a raw list item. A bare message counts as its first delivery.
    pub fn decode(raw: &str) -> std::result::Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("Invalid JSON: {}", e))?;

        let is_envelope = value.get("deliveryCount").is_some() && value.get("body").is_some();
        if is_envelope {
            serde_json::from_value(value).map_err(|e| format!("Invalid envelope: {}", e))
        } else {
            Ok(Self {
                delivery_count: 1,
                body: value,
            })
        }
    }
}

/// Dead-letter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub reason: String,
    pub description: String,
    pub body: serde_json::Value,
    pub dead_lettered_at: String,
}

impl DeadLetter {
    fn new(reason: &str, description: String, body: serde_json::Value) -> Self {
        Self {
            reason: reason.to_string(),
            description,
            body,
            dead_lettered_at: format_utc_rfc3339(Utc::now()),
        }
    }
}

/// What to do with a message after handling it.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Complete,
    /// Put back on the queue with an incremented delivery count
    Abandon(Envelope),
    /// Put back on the queue unchanged
    Defer(Envelope),
    DeadLetter(DeadLetter),
}

/// Consumer of valid queue messages.
///
/// Returning [`AppError::Deferred`] re-queues the message without counting a
/// delivery; any other error counts towards [`MAX_DELIVERY_COUNT`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage, request: SyncRequest) -> Result<()>;
}

/// Decode, validate and handle one raw list item.
pub async fn process_message(raw: &str, handler: &dyn MessageHandler) -> Disposition {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(description) => {
            return Disposition::DeadLetter(DeadLetter::new(
                REASON_MALFORMED,
                description,
                serde_json::Value::String(raw.to_string()),
            ))
        }
    };

    let parsed = serde_json::from_value::<QueueMessage>(envelope.body.clone())
        .map_err(|e| e.to_string())
        .and_then(|message| message.request().map(|request| (message, request)));
    let (message, request) = match parsed {
        Ok(parsed) => parsed,
        Err(description) => {
            return Disposition::DeadLetter(DeadLetter::new(
                REASON_MALFORMED,
                description,
                envelope.body,
            ))
        }
    };

    let correlation_id = message
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(
        message_type = %message.message_type,
        correlation_id = %correlation_id,
        delivery_count = envelope.delivery_count,
        "Handling queue message"
    );

    match handler.handle(&message, request).await {
        Ok(()) => Disposition::Complete,
        Err(AppError::Deferred(reason)) => {
            tracing::info!(
                message_type = %message.message_type,
                correlation_id = %correlation_id,
                reason = %reason,
                "Queue message deferred"
            );
            Disposition::Defer(envelope)
        }
        Err(e) if envelope.delivery_count >= MAX_DELIVERY_COUNT => {
            Disposition::DeadLetter(DeadLetter::new(
                REASON_MAX_DELIVERY,
                e.to_string(),
                envelope.body,
            ))
        }
        Err(e) => {
            tracing::warn!(
                message_type = %message.message_type,
                delivery_count = envelope.delivery_count,
                error = %e,
                "Queue message failed, will retry"
            );
            Disposition::Abandon(Envelope {
                delivery_count: envelope.delivery_count + 1,
                body: envelope.body,
            })
        }
    }
}

/// Backoff before redelivering an abandoned message.
///
/// `delivery_count` is the count the message will carry on its next delivery,
/// so the first retry waits `base` and each later one doubles it.
pub fn retry_backoff(base: Duration, delivery_count: u32) -> Duration {
    let exponent = delivery_count.saturating_sub(2).min(16);
    base.saturating_mul(1 << exponent).min(MAX_RETRY_DELAY)
}

/// List operations the listener runs against.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Move the oldest message onto the in-flight list and return it.
    async fn receive(&self) -> Result<Option<String>>;

    /// Apply `disposition` and drop `raw` from the in-flight list.
    async fn settle(&self, raw: &str, disposition: &Disposition) -> Result<()>;

    /// Put messages left in flight by an earlier run back on the queue.
    async fn recover(&self) -> Result<usize>;
}

/// Polls a [`QueueTransport`] and hands each message to a [`MessageHandler`].
pub struct QueueListener {
    transport: Arc<dyn QueueTransport>,
    poll_interval: Duration,
    retry_delay: Duration,
}

impl QueueListener {
    pub fn new(transport: Arc<dyn QueueTransport>, poll_interval: Duration) -> Self {
        Self {
            transport,
            poll_interval,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// How long to wait before polling again.
    fn delay_after(&self, disposition: &Disposition) -> Duration {
        match disposition {
            Disposition::Complete | Disposition::DeadLetter(_) => Duration::ZERO,
            Disposition::Defer(_) => self.retry_delay,
            Disposition::Abandon(envelope) => {
                retry_backoff(self.retry_delay, envelope.delivery_count)
            }
        }
    }

    async fn poll_once(&self, handler: &dyn MessageHandler) -> Result<Duration> {
        let Some(raw) = self.transport.receive().await? else {
            return Ok(self.poll_interval);
        };

        let disposition = process_message(&raw, handler).await;
        if let Disposition::DeadLetter(letter) = &disposition {
            tracing::error!(
                reason = %letter.reason,
                description = %letter.description,
                "Dead-lettering queue message"
            );
        }
        self.transport.settle(&raw, &disposition).await?;
        Ok(self.delay_after(&disposition))
    }

    /// Consume until `cancel` fires.
    pub async fn run(self, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) {
        match self.transport.recover().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Re-queued in-flight queue messages"),
            Err(e) => tracing::warn!(error = %e, "Failed to recover in-flight queue messages"),
        }
        tracing::info!("Queue listener started");

        while !cancel.is_cancelled() {
            let delay = match self.poll_once(handler.as_ref()).await {
                Ok(delay) => delay,
                Err(e) => {
                    tracing::warn!(error = %e, "Queue poll failed");
                    self.poll_interval
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        tracing::info!("Queue listener stopped");
    }

    pub fn spawn(
        self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(handler, cancel))
    }
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Start consuming in the background until `cancel` fires.
    fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>>;

    async fn is_connected(&self) -> bool;
}

/// Build the queue listener from configuration, degrading to [`NoopQueue`].
pub async fn connect_queue(url: Option<&str>, queue_name: &str) -> Arc<dyn QueueService> {
    let Some(url) = url else {
        return Arc::new(NoopQueue);
    };
    match connect_redis(url).await {
        Ok(conn) => {
            tracing::info!(queue = queue_name, "Queue connected");
            Arc::new(RedisQueue::new(conn, queue_name, DEFAULT_POLL_INTERVAL))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Queue unavailable, continuing without it");
            Arc::new(NoopQueue)
        }
    }
}

fn queue_error(e: impl std::fmt::Display) -> AppError {
    AppError::Queue(e.to_string())
}

/// Redis lists backing the queue.
#[derive(Clone)]
pub struct RedisTransport {
    conn: ConnectionManager,
    queue: String,
    processing_queue: String,
    dead_letter_queue: String,
}

impl RedisTransport {
    pub fn new(conn: ConnectionManager, queue: &str) -> Self {
        Self {
            conn,
            queue: queue.to_string(),
            processing_queue: format!("{}:processing", queue),
            dead_letter_queue: format!("{}:deadletter", queue),
        }
    }
}

#[async_trait]
impl QueueTransport for RedisTransport {
    async fn receive(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("LMOVE")
            .arg(&self.queue)
            .arg(&self.processing_queue)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await
            .map_err(queue_error)
    }

    async fn settle(&self, raw: &str, disposition: &Disposition) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        match disposition {
            Disposition::Complete => {}
            Disposition::Abandon(envelope) | Disposition::Defer(envelope) => {
                let item = serde_json::to_string(envelope).map_err(queue_error)?;
                pipe.cmd("LPUSH").arg(&self.queue).arg(item).ignore();
            }
            Disposition::DeadLetter(letter) => {
                let item = serde_json::to_string(letter).map_err(queue_error)?;
                pipe.cmd("LPUSH").arg(&self.dead_letter_queue).arg(item).ignore();
            }
        }
        pipe.cmd("LREM").arg(&self.processing_queue).arg(1).arg(raw).ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(queue_error)
    }

    async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            // Back onto the consuming end so they are handled first
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_queue)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(queue_error)?;
            if moved.is_none() {
                return Ok(recovered);
            }
            recovered += 1;
        }
    }
}

pub struct RedisQueue {
    transport: RedisTransport,
    poll_interval: Duration,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, queue: &str, poll_interval: Duration) -> Self {
        Self {
            transport: RedisTransport::new(conn, queue),
            poll_interval,
        }
    }
}

#[async_trait]
impl QueueService for RedisQueue {
    fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        tracing::info!(queue = %self.transport.queue, "Starting queue listener");
        let transport = Arc::new(self.transport.clone());
        Some(QueueListener::new(transport, self.poll_interval).spawn(handler, cancel))
    }

    async fn is_connected(&self) -> bool {
        ping(&self.transport.conn).await
    }
}

pub struct NoopQueue;

#[async_trait]
impl QueueService for NoopQueue {
    fn start(
        &self,
        _handler: Arc<dyn MessageHandler>,
        _cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        None
    }

    async fn is_connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records requests and fails while `fail` is set.
    struct RecordingHandler {
        fail: bool,
        seen: Mutex<Vec<SyncRequest>>,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _message: &QueueMessage, request: SyncRequest) -> Result<()> {
            self.seen.lock().unwrap().push(request);
            if self.fail {
                Err(AppError::Queue("practice API unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn entity_changed_maps_by_entity_type() {
        let practitioner: QueueMessage = serde_json::from_value(json!({
            "type": "entity.changed",
            "correlationId": "c1",
            "payload": {"entityType": "practitioner", "entityId": "dr-1", "action": "updated"}
        }))
        .unwrap();
        assert_eq!(
            practitioner.request(),
            Ok(SyncRequest::Practitioner("dr-1".to_string()))
        );

        let patient: QueueMessage = serde_json::from_value(json!({
            "type": "entity.changed",
            "payload": {"entityType": "patient", "entityId": "p-9"}
        }))
        .unwrap();
        assert_eq!(patient.request(), Ok(SyncRequest::All));
    }

    #[test]
    fn payload_required_for_targeted_types() {
        let message: QueueMessage =
            serde_json::from_value(json!({"type": "practitioner.sync.requested"})).unwrap();
        assert!(message.request().is_err());
    }

    #[test]
    fn bare_body_is_first_delivery() {
        let envelope = Envelope::decode(r#"{"type":"sync.requested"}"#).unwrap();
        assert_eq!(envelope.delivery_count, 1);
        assert_eq!(envelope.body["type"], "sync.requested");

        let wrapped =
            Envelope::decode(r#"{"deliveryCount":3,"body":{"type":"sync.requested"}}"#).unwrap();
        assert_eq!(wrapped.delivery_count, 3);
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_immediately() {
        let handler = RecordingHandler::new(false);

        for raw in ["not json", r#"{"type":"bogus.type"}"#, r#"{"timestamp":"x"}"#] {
            match process_message(raw, &handler).await {
                Disposition::DeadLetter(letter) => assert_eq!(letter.reason, REASON_MALFORMED),
                other => panic!("expected dead letter for {raw}, got {other:?}"),
            }
        }
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_abandons_until_max_delivery_count() {
        let handler = RecordingHandler::new(true);

        match process_message(r#"{"type":"sync.requested"}"#, &handler).await {
            Disposition::Abandon(envelope) => assert_eq!(envelope.delivery_count, 2),
            other => panic!("expected abandon, got {other:?}"),
        }

        let last = Envelope {
            delivery_count: MAX_DELIVERY_COUNT,
            body: json!({"type": "sync.requested"}),
        };
        let raw = serde_json::to_string(&last).unwrap();
        match process_message(&raw, &handler).await {
            Disposition::DeadLetter(letter) => {
                assert_eq!(letter.reason, REASON_MAX_DELIVERY);
                assert_eq!(letter.body["type"], "sync.requested");
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deferred_message_keeps_its_delivery_count() {
        struct BusyHandler;

        #[async_trait]
        impl MessageHandler for BusyHandler {
            async fn handle(&self, _message: &QueueMessage, _request: SyncRequest) -> Result<()> {
                Err(AppError::Deferred("sync already in progress".to_string()))
            }
        }

        let last = Envelope {
            delivery_count: MAX_DELIVERY_COUNT,
            body: json!({"type": "sync.requested"}),
        };
        let raw = serde_json::to_string(&last).unwrap();
        assert_eq!(
            process_message(&raw, &BusyHandler).await,
            Disposition::Defer(last)
        );
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(retry_backoff(base, 2), Duration::from_secs(5));
        assert_eq!(retry_backoff(base, 3), Duration::from_secs(10));
        assert_eq!(retry_backoff(base, 5), Duration::from_secs(40));
        assert_eq!(retry_backoff(base, 30), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn message_without_timestamp_or_correlation_id_is_handled() {
        let handler = RecordingHandler::new(false);
        let raw = json!({
            "type": "practitioner.sync.requested",
            "payload": {"entityType": "practitioner", "entityId": "dr-4"}
        })
        .to_string();
        let outcome = process_message(&raw, &handler).await;
        assert_eq!(outcome, Disposition::Complete);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![SyncRequest::Practitioner("dr-4".to_string())]
        );
    }

    #[tokio::test]
    async fn success_completes() {
        let handler = RecordingHandler::new(false);
        let outcome = process_message(r#"{"type":"directory.sync.requested"}"#, &handler).await;
        assert_eq!(outcome, Disposition::Complete);
        assert_eq!(*handler.seen.lock().unwrap(), vec![SyncRequest::Directory]);
    }
}
