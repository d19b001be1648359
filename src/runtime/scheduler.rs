//! Cron and startup triggers for full sync passes.

use super::{SyncScope, SyncTrigger, TriggerSource};
use crate::error::{AppError, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// Sends a full-sync trigger on every tick of a cron schedule.
pub struct SyncScheduler {
    scheduler: JobScheduler,
    schedule: String,
}

impl SyncScheduler {
    /// Register the sync job. `schedule` is a six-field cron expression
    /// (seconds first) evaluated in `timezone`.
    pub async fn new(
        schedule: &str,
        timezone: chrono_tz::Tz,
        triggers: mpsc::Sender<SyncTrigger>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to create scheduler: {:?}", e)))?;

        let job = Job::new_async_tz(schedule, timezone, move |_id, _lock| {
            let triggers = triggers.clone();
            Box::pin(async move {
                send_trigger(&triggers, TriggerSource::Schedule);
            })
        })
        .map_err(|e| AppError::Scheduler(format!("Invalid schedule '{}': {:?}", schedule, e)))?;

        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to register sync job: {:?}", e)))?;

        Ok(Self {
            scheduler,
            schedule: schedule.to_string(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to start scheduler: {:?}", e)))?;
        tracing::info!(schedule = %self.schedule, "Sync scheduler started");
        Ok(())
    }

    /// Stop firing new triggers.
    pub async fn stop(&mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to stop scheduler: {:?}", e)))?;
        tracing::info!("Sync scheduler stopped");
        Ok(())
    }
}

/// Queue a full-sync trigger without blocking; a full channel drops it.
fn send_trigger(triggers: &mpsc::Sender<SyncTrigger>, source: TriggerSource) {
    match triggers.try_send(SyncTrigger::new(source, SyncScope::All)) {
        Ok(()) => tracing::debug!(%source, "Sync triggered"),
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%source, "Trigger queue full, skipping this tick")
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(%source, "Trigger channel closed")
        }
    }
}

/// Fire one full sync after `delay` unless cancelled first.
pub fn spawn_startup_trigger(
    triggers: mpsc::Sender<SyncTrigger>,
    delay: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(delay_secs = delay.as_secs(), "Startup sync scheduled");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => send_trigger(&triggers, TriggerSource::Startup),
        }
    })
}
