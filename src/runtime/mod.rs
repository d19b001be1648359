// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Worker runtime: shared state, sync triggers and the pass loop.
//!
//! Every trigger source (cron schedule, startup delay, queue listener) sends a
//! [`SyncTrigger`] on one channel. The consumer hands each trigger to
//! [`SyncRuntime::run`], which refuses to start while another pass is in
//! progress or once shutdown has begun.

pub mod metrics;
pub mod scheduler;

pub use metrics::WorkerMetrics;
pub use scheduler::{spawn_startup_trigger, SyncScheduler};

use crate::error::AppError;
use crate::models::{EntityType, PractitionerRef, SyncResult};
use crate::services::broadcast::{BroadcastEvent, BroadcastService};
use crate::services::cache::{invalidate_practitioner, CacheService};
use crate::services::queue::{MessageHandler, QueueMessage, SyncRequest};
use crate::services::sync::{failed_result, FullSync};
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// Pending triggers buffered before new ones are dropped.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 16;

/// How often `wait_idle` re-checks the syncing flag.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Worker state
// ─────────────────────────────────────────────────────────────────────────────

/// Summary of the most recent finished pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "binding-generation", derive(ts_rs::TS))]
#[cfg_attr(feature = "binding-generation", ts(export, export_to = "bindings/"))]
pub struct LastSync {
    pub finished_at: String,
    pub source: String,
    pub success: bool,
    pub practitioners: u32,
    pub errors: u32,
    pub duration_ms: u64,
}

/// Process-wide state shared by the runtime and the health server.
#[derive(Debug)]
pub struct WorkerState {
    shutting_down: AtomicBool,
    syncing: AtomicBool,
    metrics: WorkerMetrics,
    last_sync: RwLock<Option<LastSync>>,
    started_at: Instant,
}

impl WorkerState {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            shutting_down: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            metrics: WorkerMetrics::new()?,
            last_sync: RwLock::new(None),
            started_at: Instant::now(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn sync_count(&self) -> u64 {
        self.metrics.syncs_total.get()
    }

    pub fn error_count(&self) -> u64 {
        self.metrics.errors_total.get()
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn last_sync(&self) -> Option<LastSync> {
        self.last_sync.read().await.clone()
    }

    /// Claim the syncing flag; `None` if a pass is already running.
    fn try_begin_sync(&self) -> Option<SyncingGuard<'_>> {
        self.syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| {
                self.metrics.in_progress.set(1);
                SyncingGuard { state: self }
            })
    }

    async fn record_pass(&self, last: LastSync) {
        self.metrics.syncs_total.inc();
        self.metrics.errors_total.inc_by(u64::from(last.errors));
        *self.last_sync.write().await = Some(last);
    }
}

/// Clears the syncing flag when a pass ends, including on panic.
struct SyncingGuard<'a> {
    state: &'a WorkerState,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.state.metrics.in_progress.set(0);
        self.state.syncing.store(false, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Triggers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Schedule,
    Startup,
    Queue,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Startup => "startup",
            TriggerSource::Queue => "queue",
        })
    }
}

/// What a pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Every active practitioner
    All,
    /// One practitioner by external id
    Practitioner(String),
    /// Practitioner directory only
    Directory,
}

impl From<SyncRequest> for SyncScope {
    fn from(request: SyncRequest) -> Self {
        match request {
            SyncRequest::All => SyncScope::All,
            SyncRequest::Practitioner(id) => SyncScope::Practitioner(id),
            SyncRequest::Directory => SyncScope::Directory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InProgress,
    ShuttingDown,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::InProgress => "sync already in progress",
            SkipReason::ShuttingDown => "worker is shutting down",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed { success: bool },
    Skipped(SkipReason),
}

/// Request to run a pass.
#[derive(Debug)]
pub struct SyncTrigger {
    pub source: TriggerSource,
    pub scope: SyncScope,
    /// Receives the outcome once the pass finishes or is skipped
    pub reply: Option<oneshot::Sender<TriggerOutcome>>,
}

impl SyncTrigger {
    pub fn new(source: TriggerSource, scope: SyncScope) -> Self {
        Self {
            source,
            scope,
            reply: None,
        }
    }

    pub fn with_reply(
        source: TriggerSource,
        scope: SyncScope,
    ) -> (Self, oneshot::Receiver<TriggerOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                source,
                scope,
                reply: Some(tx),
            },
            rx,
        )
    }
}

pub fn trigger_channel() -> (mpsc::Sender<SyncTrigger>, mpsc::Receiver<SyncTrigger>) {
    mpsc::channel(TRIGGER_CHANNEL_CAPACITY)
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

pub struct SyncRuntime {
    state: Arc<WorkerState>,
    sync: Arc<dyn FullSync>,
    cache: Arc<dyn CacheService>,
    broadcast: Arc<dyn BroadcastService>,
}

impl SyncRuntime {
    pub fn new(
        state: Arc<WorkerState>,
        sync: Arc<dyn FullSync>,
        cache: Arc<dyn CacheService>,
        broadcast: Arc<dyn BroadcastService>,
    ) -> Self {
        Self {
            state,
            sync,
            cache,
            broadcast,
        }
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Sync every active practitioner.
    pub async fn run_full_sync(&self, source: TriggerSource) -> TriggerOutcome {
        self.run(SyncScope::All, source).await
    }

    /// Run one pass unless another is in progress or shutdown has begun.
    pub async fn run(&self, scope: SyncScope, source: TriggerSource) -> TriggerOutcome {
        if self.state.is_shutting_down() {
            tracing::info!(%source, "Shutting down, ignoring sync trigger");
            return TriggerOutcome::Skipped(SkipReason::ShuttingDown);
        }
        let Some(_guard) = self.state.try_begin_sync() else {
            tracing::info!(%source, "Sync already in progress, ignoring trigger");
            return TriggerOutcome::Skipped(SkipReason::InProgress);
        };

        let started = Instant::now();
        tracing::info!(%source, scope = ?scope, "Sync pass starting");

        let results = match &scope {
            SyncScope::All => self.sync_all().await,
            SyncScope::Practitioner(external_id) => self.sync_one(external_id).await,
            SyncScope::Directory => vec![self.sync_directory().await],
        };

        let errors: usize = results.iter().map(|r| r.errors.len()).sum();
        let success = results.iter().all(|r| r.success);
        let last = LastSync {
            finished_at: format_utc_rfc3339(Utc::now()),
            source: source.to_string(),
            success,
            practitioners: results.len() as u32,
            errors: errors as u32,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            %source,
            success,
            practitioners = last.practitioners,
            errors = last.errors,
            duration_ms = last.duration_ms,
            "Sync pass finished"
        );
        self.state.record_pass(last).await;

        TriggerOutcome::Completed { success }
    }

    async fn sync_all(&self) -> Vec<SyncResult> {
        let practitioners = match self.sync.active_practitioners().await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active practitioners");
                return vec![failed_result(EntityType::Practitioner, "*", &e)];
            }
        };
        tracing::info!(count = practitioners.len(), "Syncing active practitioners");

        let mut results = Vec::with_capacity(practitioners.len());
        for practitioner in &practitioners {
            if self.state.is_shutting_down() {
                tracing::info!(
                    remaining = practitioners.len() - results.len(),
                    "Shutdown requested, stopping before next practitioner"
                );
                break;
            }
            let result = self.sync.full_sync(&practitioner.external_id).await;
            self.after_practitioner(practitioner, &result).await;
            results.push(result);
        }
        results
    }

    async fn sync_one(&self, external_id: &str) -> Vec<SyncResult> {
        let result = self.sync.full_sync(external_id).await;

        match self.find_practitioner(external_id).await {
            Some(practitioner) => self.after_practitioner(&practitioner, &result).await,
            None => tracing::debug!(
                practitioner = external_id,
                "Practitioner not active locally, skipping notifications"
            ),
        }
        vec![result]
    }

    async fn sync_directory(&self) -> SyncResult {
        match self.sync.sync_practitioner_directory().await {
            Ok(result) => result,
            Err(e) => failed_result(EntityType::Practitioner, "directory", &e),
        }
    }

    async fn find_practitioner(&self, external_id: &str) -> Option<PractitionerRef> {
        match self.sync.active_practitioners().await {
            Ok(list) => list.into_iter().find(|p| p.external_id == external_id),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up practitioner");
                None
            }
        }
    }

    /// Invalidate cached reads and notify subscribers. Failures are logged only.
    async fn after_practitioner(&self, practitioner: &PractitionerRef, result: &SyncResult) {
        if result.success {
            invalidate_practitioner(self.cache.as_ref(), practitioner.id).await;
        }

        let event = BroadcastEvent::for_sync(practitioner, result);
        if let Err(e) = self.broadcast.publish(&event).await {
            tracing::warn!(
                practitioner = %practitioner.external_id,
                error = %e,
                "Failed to broadcast sync event"
            );
        }
    }

    /// Drain triggers until the channel closes or `cancel` fires.
    ///
    /// Each trigger runs on its own task so a trigger arriving mid-pass is
    /// answered (skipped) immediately instead of waiting in the channel.
    pub async fn run_triggers(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<SyncTrigger>,
        cancel: CancellationToken,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let runtime = Arc::clone(&self);
            tokio::spawn(async move {
                let outcome = runtime.run(trigger.scope, trigger.source).await;
                if let Some(reply) = trigger.reply {
                    let _ = reply.send(outcome);
                }
            });
        }
        tracing::info!("Trigger loop stopped");
    }

    /// Wait up to `grace` for an in-progress pass to finish.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.state.is_syncing() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        true
    }
}

/// Turns queue messages into triggers and waits for their outcome.
pub struct TriggerHandler {
    triggers: mpsc::Sender<SyncTrigger>,
}

impl TriggerHandler {
    pub fn new(triggers: mpsc::Sender<SyncTrigger>) -> Self {
        Self { triggers }
    }
}

#[async_trait]
impl MessageHandler for TriggerHandler {
    async fn handle(
        &self,
        message: &QueueMessage,
        request: SyncRequest,
    ) -> crate::error::Result<()> {
        let (trigger, outcome) = SyncTrigger::with_reply(TriggerSource::Queue, request.into());
        self.triggers
            .send(trigger)
            .await
            .map_err(|_| AppError::Deferred("trigger channel closed".to_string()))?;

        match outcome.await {
            Ok(TriggerOutcome::Completed { success }) => {
                tracing::info!(
                    message_type = %message.message_type,
                    success,
                    "Queue-triggered sync finished"
                );
                Ok(())
            }
            Ok(TriggerOutcome::Skipped(reason)) => Err(AppError::Deferred(reason.to_string())),
            Err(_) => Err(AppError::Deferred("trigger dropped before completion".to_string())),
        }
    }
}
