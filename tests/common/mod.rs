// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use practice_sync::db::{SqliteStore, SyncStore};
use practice_sync::error::{AppError, Result};
use practice_sync::models::{
    ClientRecord, PractitionerRecord, PractitionerRef, SessionRecord, SlotRecord, SyncResult,
    UpsertOutcome,
};
use practice_sync::services::fhir::{FhirAppointment, FhirPatient, FhirPractitioner, FhirSlot};
use practice_sync::services::PracticeApi;
use practice_sync::time_utils::format_utc_rfc3339;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Create a schema-ready store in a fresh temporary directory.
///
/// Keep the returned `TempDir` alive for the duration of the test.
#[allow(dead_code)]
pub async fn temp_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("practice.db");
    let store = SqliteStore::connect(path.to_str().unwrap(), 2).expect("Failed to open store");
    store.ensure_schema().await.expect("Failed to create schema");
    (dir, Arc::new(store))
}

/// Shorthand for an instant relative to now, in the stored format.
#[allow(dead_code)]
pub fn hours_from_now(hours: i64) -> String {
    format_utc_rfc3339(Utc::now() + Duration::hours(hours))
}

// ─── FHIR fixtures ───────────────────────────────────────────────────────────

#[allow(dead_code)]
pub fn practitioner(id: &str, name: &str) -> FhirPractitioner {
    serde_json::from_value(json!({
        "resourceType": "Practitioner",
        "id": id,
        "active": true,
        "name": [{"text": name}],
        "telecom": [{"system": "email", "value": format!("{}@example.com", id)}]
    }))
    .unwrap()
}

#[allow(dead_code)]
pub fn patient(id: &str) -> FhirPatient {
    serde_json::from_value(json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"given": ["Pat"], "family": id}],
        "telecom": [{"system": "phone", "value": "555-0100"}],
        "birthDate": "1985-04-12"
    }))
    .unwrap()
}

#[allow(dead_code)]
pub fn appointment(id: &str, patient_id: Option<&str>, status: &str) -> FhirAppointment {
    let mut participant = vec![json!({"actor": {"reference": "Practitioner/dr-1"}})];
    if let Some(patient_id) = patient_id {
        participant.push(json!({"actor": {"reference": format!("Patient/{}", patient_id)}}));
    }
    serde_json::from_value(json!({
        "resourceType": "Appointment",
        "id": id,
        "status": status,
        "start": hours_from_now(24),
        "end": hours_from_now(25),
        "participant": participant
    }))
    .unwrap()
}

#[allow(dead_code)]
pub fn slot(id: &str, start_hours: i64) -> FhirSlot {
    serde_json::from_value(json!({
        "resourceType": "Slot",
        "id": id,
        "status": "free",
        "start": hours_from_now(start_hours),
        "end": format_utc_rfc3339(Utc::now() + Duration::hours(start_hours) + Duration::minutes(50))
    }))
    .unwrap()
}

// ─── Fake practice API ───────────────────────────────────────────────────────

/// In-memory practice API keyed by practitioner external id.
#[derive(Default)]
pub struct FakeApi {
    pub practitioners: Mutex<Vec<FhirPractitioner>>,
    pub patients: Mutex<HashMap<String, Vec<FhirPatient>>>,
    pub appointments: Mutex<HashMap<String, Vec<FhirAppointment>>>,
    pub slots: Mutex<HashMap<String, Vec<FhirSlot>>>,
    /// Fail patient listing with a transient error
    pub fail_patients: AtomicBool,
    /// Fail patient listing with an authentication error
    pub reject_token: AtomicBool,
}

#[allow(dead_code)]
impl FakeApi {
    /// One practitioner with two patients, two appointments and two slots.
    pub fn with_practice(practitioner_id: &str) -> Self {
        let api = FakeApi::default();
        api.practitioners
            .lock()
            .unwrap()
            .push(practitioner(practitioner_id, "Dr. Ada Byron"));
        api.patients.lock().unwrap().insert(
            practitioner_id.to_string(),
            vec![patient("pat-1"), patient("pat-2")],
        );
        api.appointments.lock().unwrap().insert(
            practitioner_id.to_string(),
            vec![
                appointment("appt-1", Some("pat-1"), "booked"),
                appointment("appt-2", Some("pat-2"), "noshow"),
            ],
        );
        api.slots.lock().unwrap().insert(
            practitioner_id.to_string(),
            vec![slot("slot-1", 48), slot("slot-2", 72)],
        );
        api
    }

    pub fn set_patients(&self, practitioner_id: &str, patients: Vec<FhirPatient>) {
        self.patients
            .lock()
            .unwrap()
            .insert(practitioner_id.to_string(), patients);
    }

    fn list<T: Clone>(map: &Mutex<HashMap<String, Vec<T>>>, key: &str) -> Vec<T> {
        map.lock().unwrap().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl PracticeApi for FakeApi {
    async fn fetch_practitioners(&self) -> Result<Vec<FhirPractitioner>> {
        Ok(self.practitioners.lock().unwrap().clone())
    }

    async fn fetch_practitioner(&self, id: &str) -> Result<FhirPractitioner> {
        self.practitioners
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Practitioner/{}", id)))
    }

    async fn fetch_patients(&self, practitioner_id: &str) -> Result<Vec<FhirPatient>> {
        if self.reject_token.load(Ordering::SeqCst) {
            return Err(AppError::Unauthorized);
        }
        if self.fail_patients.load(Ordering::SeqCst) {
            return Err(AppError::ExternalApi("HTTP 502: upstream unavailable".to_string()));
        }
        Ok(Self::list(&self.patients, practitioner_id))
    }

    async fn fetch_appointments(
        &self,
        practitioner_id: &str,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<FhirAppointment>> {
        Ok(Self::list(&self.appointments, practitioner_id))
    }

    async fn fetch_slots(
        &self,
        practitioner_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<FhirSlot>> {
        Ok(Self::list(&self.slots, practitioner_id))
    }
}

// ─── Store wrapper with injected failures ────────────────────────────────────

/// Delegates to a real store but rejects client upserts for chosen patients.
#[allow(dead_code)]
pub struct FlakyStore {
    pub inner: Arc<SqliteStore>,
    pub failing_clients: Vec<String>,
}

#[async_trait]
impl SyncStore for FlakyStore {
    async fn list_active_practitioners(&self) -> Result<Vec<PractitionerRef>> {
        self.inner.list_active_practitioners().await
    }

    async fn upsert_practitioner(&self, record: &PractitionerRecord) -> Result<UpsertOutcome> {
        self.inner.upsert_practitioner(record).await
    }

    async fn upsert_client(&self, record: &ClientRecord) -> Result<UpsertOutcome> {
        if self.failing_clients.contains(&record.external_id) {
            return Err(AppError::Database("constraint failed".to_string()));
        }
        self.inner.upsert_client(record).await
    }

    async fn find_client_id(&self, external_id: &str, practitioner_id: i64) -> Result<Option<i64>> {
        self.inner.find_client_id(external_id, practitioner_id).await
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<UpsertOutcome> {
        self.inner.upsert_session(record).await
    }

    async fn delete_past_slots(&self, practitioner_id: i64, now: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_past_slots(practitioner_id, now).await
    }

    async fn upsert_slot(&self, record: &SlotRecord) -> Result<UpsertOutcome> {
        self.inner.upsert_slot(record).await
    }

    async fn record_sync_log(&self, key: &str, result: &SyncResult) -> Result<()> {
        self.inner.record_sync_log(key, result).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
