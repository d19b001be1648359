// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sync orchestration for one practitioner.
//!
//! A pass runs strictly in order:
//! 1. Upsert the practitioner (fatal on failure)
//! 2. Upsert their patients as clients
//! 3. Upsert appointments in the lookback/lookahead window as sessions
//! 4. Drop past slots, then upsert upcoming availability
//! 5. Append the result to the sync log
//!
//! Per-item failures are collected into the result and never stop a stage.

use crate::db::SyncStore;
use crate::error::{AppError, Result};
use crate::models::{EntityType, PractitionerRef, SyncResult};
use crate::services::practice_api::PracticeApi;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Sync-log key for directory refreshes.
pub const DIRECTORY_LOG_KEY: &str = "directory";

/// What the runtime needs from the orchestrator.
#[async_trait]
pub trait FullSync: Send + Sync {
    /// Practitioners to include in a full pass.
    async fn active_practitioners(&self) -> Result<Vec<PractitionerRef>>;

    /// Sync everything for one practitioner.
    async fn full_sync(&self, practitioner_external_id: &str) -> SyncResult;

    /// Refresh the practitioner directory only.
    async fn sync_practitioner_directory(&self) -> Result<SyncResult>;
}

pub struct SyncOrchestrator {
    api: Arc<dyn PracticeApi>,
    store: Arc<dyn SyncStore>,
    lookback_days: i64,
    lookahead_days: i64,
}

impl SyncOrchestrator {
    pub fn new(
        api: Arc<dyn PracticeApi>,
        store: Arc<dyn SyncStore>,
        lookback_days: i64,
        lookahead_days: i64,
    ) -> Self {
        Self {
            api,
            store,
            lookback_days,
            lookahead_days,
        }
    }

    async fn run_stages(&self, external_id: &str, result: &mut SyncResult) {
        let practitioner_id = match self.sync_practitioner(external_id, result).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    practitioner = external_id,
                    error = %e,
                    "Practitioner stage failed, aborting pass"
                );
                result.record_error(EntityType::Practitioner, external_id, e);
                return;
            }
        };

        let stages = [EntityType::Client, EntityType::Session, EntityType::Availability];
        for stage in stages {
            let outcome = match stage {
                EntityType::Client => self.sync_clients(external_id, practitioner_id, result).await,
                EntityType::Session => {
                    self.sync_sessions(external_id, practitioner_id, result).await
                }
                _ => {
                    self.sync_availability(external_id, practitioner_id, result)
                        .await
                }
            };

            if let Err(e) = outcome {
                let abort = e.is_auth_error();
                result.record_error(stage, external_id, format!("Failed to list {}: {}", stage, e));
                if abort {
                    tracing::error!(
                        practitioner = external_id,
                        stage = %stage,
                        "Authentication failed, aborting pass"
                    );
                    return;
                }
            }
        }
    }

    async fn sync_practitioner(&self, external_id: &str, result: &mut SyncResult) -> Result<i64> {
        let practitioner = self.api.fetch_practitioner(external_id).await?;
        let record = practitioner.to_record()?;
        let outcome = self.store.upsert_practitioner(&record).await?;
        result.record_upsert(outcome);
        Ok(outcome.id)
    }

    async fn sync_clients(
        &self,
        external_id: &str,
        practitioner_id: i64,
        result: &mut SyncResult,
    ) -> Result<()> {
        let patients = self.api.fetch_patients(external_id).await?;
        tracing::debug!(practitioner = external_id, count = patients.len(), "Syncing clients");

        for patient in patients {
            let upserted = match patient.to_record(practitioner_id) {
                Ok(record) => self.store.upsert_client(&record).await,
                Err(e) => Err(e),
            };
            match upserted {
                Ok(outcome) => result.record_upsert(outcome),
                Err(e) => result.record_error(EntityType::Client, &patient.id, e),
            }
        }
        Ok(())
    }

    async fn sync_sessions(
        &self,
        external_id: &str,
        practitioner_id: i64,
        result: &mut SyncResult,
    ) -> Result<()> {
        let today = Utc::now().date_naive();
        let from = today - Duration::days(self.lookback_days);
        let to = today + Duration::days(self.lookahead_days);

        let appointments = self.api.fetch_appointments(external_id, from, to).await?;
        tracing::debug!(
            practitioner = external_id,
            count = appointments.len(),
            %from,
            %to,
            "Syncing sessions"
        );

        for appointment in appointments {
            let client_id = match appointment.patient_id() {
                Some(patient) => match self.store.find_client_id(patient, practitioner_id).await {
                    Ok(None) => {
                        tracing::warn!(
                            appointment = %appointment.id,
                            patient,
                            "Appointment patient not synced, leaving client unset"
                        );
                        None
                    }
                    Ok(id) => id,
                    Err(e) => {
                        result.record_error(EntityType::Session, &appointment.id, e);
                        continue;
                    }
                },
                None => None,
            };

            let upserted = match appointment.to_record(practitioner_id, client_id) {
                Ok(record) => self.store.upsert_session(&record).await,
                Err(e) => Err(e),
            };
            match upserted {
                Ok(outcome) => result.record_upsert(outcome),
                Err(e) => result.record_error(EntityType::Session, &appointment.id, e),
            }
        }
        Ok(())
    }

    async fn sync_availability(
        &self,
        external_id: &str,
        practitioner_id: i64,
        result: &mut SyncResult,
    ) -> Result<()> {
        let now = Utc::now();

        match self.store.delete_past_slots(practitioner_id, now).await {
            Ok(deleted) => {
                result.deleted += deleted as u32;
                if deleted > 0 {
                    tracing::debug!(practitioner = external_id, deleted, "Removed past slots");
                }
            }
            Err(e) => result.record_error(
                EntityType::Availability,
                external_id,
                format!("Failed to remove past slots: {}", e),
            ),
        }

        let until = now + Duration::days(self.lookahead_days);
        let slots = self.api.fetch_slots(external_id, now, until).await?;
        tracing::debug!(practitioner = external_id, count = slots.len(), "Syncing availability");

        for slot in slots {
            let upserted = match slot.to_record(practitioner_id) {
                Ok(record) => self.store.upsert_slot(&record).await,
                Err(e) => Err(e),
            };
            match upserted {
                Ok(outcome) => result.record_upsert(outcome),
                Err(e) => result.record_error(EntityType::Availability, &slot.id, e),
            }
        }
        Ok(())
    }

    async fn log_result(&self, key: &str, result: &SyncResult) {
        if let Err(e) = self.store.record_sync_log(key, result).await {
            tracing::warn!(practitioner = key, error = %e, "Failed to write sync log");
        }
    }
}

#[async_trait]
impl FullSync for SyncOrchestrator {
    async fn active_practitioners(&self) -> Result<Vec<PractitionerRef>> {
        self.store.list_active_practitioners().await
    }

    async fn full_sync(&self, practitioner_external_id: &str) -> SyncResult {
        let started = Instant::now();
        let mut result = SyncResult::default();

        tracing::info!(practitioner = practitioner_external_id, "Starting practitioner sync");
        self.run_stages(practitioner_external_id, &mut result).await;

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            practitioner = practitioner_external_id,
            success = result.success,
            created = result.created,
            updated = result.updated,
            deleted = result.deleted,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Practitioner sync finished"
        );

        self.log_result(practitioner_external_id, &result).await;
        result
    }

    async fn sync_practitioner_directory(&self) -> Result<SyncResult> {
        let started = Instant::now();
        let mut result = SyncResult::default();

        let practitioners = self.api.fetch_practitioners().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to list practitioners");
            e
        })?;

        for practitioner in practitioners {
            let upserted = match practitioner.to_record() {
                Ok(record) => self.store.upsert_practitioner(&record).await,
                Err(e) => Err(e),
            };
            match upserted {
                Ok(outcome) => result.record_upsert(outcome),
                Err(e) => result.record_error(EntityType::Practitioner, &practitioner.id, e),
            }
        }

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            created = result.created,
            updated = result.updated,
            errors = result.errors.len(),
            "Practitioner directory synced"
        );

        self.log_result(DIRECTORY_LOG_KEY, &result).await;
        Ok(result)
    }
}

/// Shorthand used when a whole pass could not start.
pub fn failed_result(entity_type: EntityType, entity_id: &str, error: &AppError) -> SyncResult {
    let mut result = SyncResult::default();
    result.record_error(entity_type, entity_id, error);
    result
}
