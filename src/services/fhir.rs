// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! FHIR resource shapes returned by the practice-management API.
//!
//! Only the fields the sync pipeline reads are modelled. Conversion into the
//! local records lives here too, so the orchestrator only deals with
//! validated data.

use crate::error::AppError;
use crate::models::{ClientRecord, PractitionerRecord, SessionRecord, SessionStatus, SlotRecord};
use crate::time_utils::{format_utc_rfc3339, parse_instant};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;

/// Resource type of the diagnostic payload some endpoints mix into bundles.
const OPERATION_OUTCOME: &str = "OperationOutcome";

/// Identifiers the upstream API uses for "no real id".
const PLACEHOLDER_IDS: [&str; 5] = ["placeholder", "undefined", "null", "none", "unknown"];

/// Default location type when a slot does not carry the extension.
const DEFAULT_LOCATION_TYPE: &str = "in_person";

/// A FHIR resource type the client can page through.
pub trait FhirResource: DeserializeOwned {
    const RESOURCE_TYPE: &'static str;

    fn id(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Search result page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub link: Vec<BundleLink>,
    #[serde(default)]
    pub entry: Vec<BundleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleEntry {
    pub resource: Option<serde_json::Value>,
}

impl Bundle {
    /// URL of the next page, if any.
    pub fn next_link(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == "next" && !l.url.trim().is_empty())
            .map(|l| l.url.as_str())
    }

    /// Extract the valid entries of type `R`, skipping ids already in `seen`.
    ///
    /// Entries without a usable id, diagnostic `OperationOutcome` payloads,
    /// entries of another type and entries that fail to deserialize are
    /// dropped without error.
    pub fn valid_entries<R: FhirResource>(self, seen: &mut HashSet<String>) -> Vec<R> {
        let mut out = Vec::with_capacity(self.entry.len());

        for resource in self.entry.into_iter().filter_map(|e| e.resource) {
            let resource_type = resource
                .get("resourceType")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            if resource_type == OPERATION_OUTCOME {
                tracing::debug!(
                    expected = R::RESOURCE_TYPE,
                    "Skipping OperationOutcome entry in bundle"
                );
                continue;
            }
            if resource_type != R::RESOURCE_TYPE {
                tracing::debug!(
                    expected = R::RESOURCE_TYPE,
                    found = resource_type,
                    "Skipping entry of unexpected type"
                );
                continue;
            }

            let id = resource
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if is_placeholder_id(id) {
                tracing::debug!(resource_type, id, "Skipping entry without a real id");
                continue;
            }
            if seen.contains(id) {
                continue;
            }

            match serde_json::from_value::<R>(resource) {
                Ok(parsed) => {
                    seen.insert(parsed.id().to_string());
                    out.push(parsed);
                }
                Err(e) => {
                    tracing::debug!(
                        resource_type = R::RESOURCE_TYPE,
                        error = %e,
                        "Skipping malformed entry"
                    );
                }
            }
        }

        out
    }
}

/// True for missing or placeholder identifiers.
pub fn is_placeholder_id(id: &str) -> bool {
    let id = id.trim();
    if id.is_empty() {
        return true;
    }
    let lower = id.to_ascii_lowercase();
    PLACEHOLDER_IDS.contains(&lower.as_str()) || lower.starts_with("placeholder")
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared datatypes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HumanName {
    pub text: Option<String>,
    pub family: Option<String>,
    #[serde(default)]
    pub given: Vec<String>,
    #[serde(default)]
    pub prefix: Vec<String>,
}

impl HumanName {
    /// Display form: `text` if present, otherwise `prefix given family`.
    pub fn display(&self) -> Option<String> {
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return Some(text.to_string());
        }
        let parts: Vec<&str> = self
            .prefix
            .iter()
            .chain(self.given.iter())
            .map(String::as_str)
            .chain(self.family.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactPoint {
    pub system: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reference {
    pub reference: Option<String>,
}

impl Reference {
    /// Id of the referenced resource if it is of `resource_type`.
    ///
    /// Accepts relative (`Patient/123`) and absolute
    /// (`https://host/fhir/Patient/123`) references.
    pub fn id_for(&self, resource_type: &str) -> Option<&str> {
        let reference = self.reference.as_deref()?;
        let mut segments = reference.rsplit('/');
        let id = segments.next()?;
        let kind = segments.next()?;
        (kind == resource_type && !is_placeholder_id(id)).then_some(id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    pub value_string: Option<String>,
    pub value_code: Option<String>,
}

fn first_name(names: &[HumanName]) -> Option<String> {
    names.iter().find_map(HumanName::display)
}

fn first_contact(telecom: &[ContactPoint], system: &str) -> Option<String> {
    telecom
        .iter()
        .filter(|c| c.system.as_deref() == Some(system))
        .find_map(|c| c.value.as_deref().map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
}

/// Parse a FHIR instant and normalize it to the stored form.
fn normalize_instant(value: Option<&str>, field: &str, id: &str) -> Result<String, AppError> {
    let raw = value.ok_or_else(|| AppError::InvalidResource(format!("{} missing {}", id, field)))?;
    parse_instant(raw)
        .map(format_utc_rfc3339)
        .ok_or_else(|| AppError::InvalidResource(format!("{} has invalid {}: {}", id, field, raw)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Practitioner
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FhirPractitioner {
    pub id: String,
    pub active: Option<bool>,
    #[serde(default)]
    pub name: Vec<HumanName>,
    #[serde(default)]
    pub telecom: Vec<ContactPoint>,
}

impl FhirResource for FhirPractitioner {
    const RESOURCE_TYPE: &'static str = "Practitioner";

    fn id(&self) -> &str {
        &self.id
    }
}

impl FhirPractitioner {
    pub fn to_record(&self) -> Result<PractitionerRecord, AppError> {
        if is_placeholder_id(&self.id) {
            return Err(AppError::InvalidResource("Practitioner without id".to_string()));
        }
        let name = first_name(&self.name).ok_or_else(|| {
            AppError::InvalidResource(format!("Practitioner {} has no name", self.id))
        })?;

        Ok(PractitionerRecord {
            external_id: self.id.clone(),
            name,
            email: first_contact(&self.telecom, "email"),
            is_active: self.active.unwrap_or(true),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Patient
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirPatient {
    pub id: String,
    #[serde(default)]
    pub name: Vec<HumanName>,
    #[serde(default)]
    pub telecom: Vec<ContactPoint>,
    pub birth_date: Option<String>,
}

impl FhirResource for FhirPatient {
    const RESOURCE_TYPE: &'static str = "Patient";

    fn id(&self) -> &str {
        &self.id
    }
}

impl FhirPatient {
    pub fn to_record(&self, practitioner_id: i64) -> Result<ClientRecord, AppError> {
        let birth_date = match self.birth_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) if is_fhir_date(raw) => Some(raw.to_string()),
            Some(raw) => {
                return Err(AppError::InvalidResource(format!(
                    "Patient {} has invalid birthDate: {}",
                    self.id, raw
                )))
            }
        };

        Ok(ClientRecord {
            external_id: self.id.clone(),
            practitioner_id,
            name: first_name(&self.name),
            email: first_contact(&self.telecom, "email"),
            phone: first_contact(&self.telecom, "phone"),
            birth_date,
        })
    }
}

/// FHIR `date`: `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
fn is_fhir_date(raw: &str) -> bool {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match raw.len() {
        4 => all_digits(raw),
        7 => NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d").is_ok(),
        10 => NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok(),
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Appointment
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FhirAppointment {
    pub id: String,
    #[serde(default)]
    pub status: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub comment: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub participant: Vec<AppointmentParticipant>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentParticipant {
    pub actor: Option<Reference>,
}

impl FhirResource for FhirAppointment {
    const RESOURCE_TYPE: &'static str = "Appointment";

    fn id(&self) -> &str {
        &self.id
    }
}

impl FhirAppointment {
    /// External id of the first patient participant.
    pub fn patient_id(&self) -> Option<&str> {
        self.participant
            .iter()
            .filter_map(|p| p.actor.as_ref())
            .find_map(|actor| actor.id_for("Patient"))
    }

    pub fn to_record(
        &self,
        practitioner_id: i64,
        client_id: Option<i64>,
    ) -> Result<SessionRecord, AppError> {
        let start = normalize_instant(self.start.as_deref(), "start", &self.id)?;
        let end = normalize_instant(self.end.as_deref(), "end", &self.id)?;
        if end < start {
            return Err(AppError::InvalidResource(format!(
                "Appointment {} ends before it starts",
                self.id
            )));
        }

        Ok(SessionRecord {
            external_id: self.id.clone(),
            practitioner_id,
            client_id,
            start,
            end,
            status: SessionStatus::from_fhir(&self.status),
            notes: self.comment.clone().or_else(|| self.description.clone()),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slot
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FhirSlot {
    pub id: String,
    #[serde(default)]
    pub status: String,
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub extension: Vec<Extension>,
}

impl FhirResource for FhirSlot {
    const RESOURCE_TYPE: &'static str = "Slot";

    fn id(&self) -> &str {
        &self.id
    }
}

impl FhirSlot {
    pub fn location_type(&self) -> String {
        self.extension
            .iter()
            .filter(|e| e.url.ends_with("location-type"))
            .find_map(|e| e.value_code.clone().or_else(|| e.value_string.clone()))
            .unwrap_or_else(|| DEFAULT_LOCATION_TYPE.to_string())
    }

    pub fn to_record(&self, practitioner_id: i64) -> Result<SlotRecord, AppError> {
        let start_raw = self.start.as_deref();
        let end_raw = self.end.as_deref();
        let start = normalize_instant(start_raw, "start", &self.id)?;
        let end = normalize_instant(end_raw, "end", &self.id)?;

        let parsed = (
            start_raw.and_then(parse_instant),
            end_raw.and_then(parse_instant),
        );
        let duration_minutes = match parsed {
            (Some(s), Some(e)) => (e - s).num_minutes(),
            _ => 0,
        };
        if duration_minutes <= 0 {
            return Err(AppError::InvalidResource(format!(
                "Slot {} has non-positive duration",
                self.id
            )));
        }

        let status = if self.status.is_empty() {
            "free".to_string()
        } else {
            self.status.clone()
        };

        Ok(SlotRecord {
            external_id: self.id.clone(),
            practitioner_id,
            start,
            end,
            duration_minutes,
            is_bookable: status == "free",
            status,
            location_type: self.location_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(value: serde_json::Value) -> Bundle {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_entries_filters_noise() {
        let page = bundle(json!({
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "p1"}},
                {"resource": {"resourceType": "OperationOutcome", "id": "warn",
                              "issue": [{"severity": "warning"}]}},
                {"resource": {"resourceType": "Patient", "id": ""}},
                {"resource": {"resourceType": "Patient", "id": "placeholder"}},
                {"resource": {"resourceType": "Patient"}},
                {"resource": {"resourceType": "Practitioner", "id": "dr1"}},
                {"resource": {"resourceType": "Patient", "id": "p2", "name": "not-a-list"}},
                {},
                {"resource": {"resourceType": "Patient", "id": "p3"}}
            ]
        }));

        let mut seen = HashSet::new();
        let patients: Vec<FhirPatient> = page.valid_entries(&mut seen);
        let ids: Vec<&str> = patients.iter().map(|p| p.id.as_str()).collect();

        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[test]
    fn valid_entries_skips_seen_ids() {
        let mut seen = HashSet::from(["p1".to_string()]);
        let page = bundle(json!({
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "p1"}},
                {"resource": {"resourceType": "Patient", "id": "p2"}}
            ]
        }));

        let patients: Vec<FhirPatient> = page.valid_entries(&mut seen);
        assert_eq!(patients.len(), 1);
        assert!(seen.contains("p2"));
    }

    #[test]
    fn next_link_only_matches_next_relation() {
        let page = bundle(json!({
            "link": [
                {"relation": "self", "url": "https://api/fhir/Patient?page=1"},
                {"relation": "next", "url": "https://api/fhir/Patient?page=2"}
            ]
        }));
        assert_eq!(page.next_link(), Some("https://api/fhir/Patient?page=2"));

        let last = bundle(json!({"link": [{"relation": "self", "url": "x"}]}));
        assert_eq!(last.next_link(), None);
    }

    #[test]
    fn human_name_display_prefers_text() {
        let name = HumanName {
            text: Some("Dr. Jane Doe".to_string()),
            family: Some("Doe".to_string()),
            given: vec!["Jane".to_string()],
            prefix: vec![],
        };
        assert_eq!(name.display().as_deref(), Some("Dr. Jane Doe"));

        let parts = HumanName {
            text: None,
            family: Some("Doe".to_string()),
            given: vec!["Jane".to_string(), "Q".to_string()],
            prefix: vec!["Dr.".to_string()],
        };
        assert_eq!(parts.display().as_deref(), Some("Dr. Jane Q Doe"));
    }

    #[test]
    fn reference_id_for_checks_type() {
        let r = Reference {
            reference: Some("https://host/fhir/Patient/abc".to_string()),
        };
        assert_eq!(r.id_for("Patient"), Some("abc"));
        assert_eq!(r.id_for("Practitioner"), None);
    }

    #[test]
    fn patient_partial_birth_dates_accepted() {
        for raw in ["1980", "1980-05", "1980-05-17"] {
            let p = FhirPatient {
                id: "p1".to_string(),
                name: vec![],
                telecom: vec![],
                birth_date: Some(raw.to_string()),
            };
            assert_eq!(p.to_record(1).unwrap().birth_date.as_deref(), Some(raw));
        }

        let bad = FhirPatient {
            id: "p2".to_string(),
            name: vec![],
            telecom: vec![],
            birth_date: Some("17/05/1980".to_string()),
        };
        assert!(bad.to_record(1).is_err());
    }

    #[test]
    fn appointment_to_record_maps_status_and_patient() {
        let appt: FhirAppointment = serde_json::from_value(json!({
            "resourceType": "Appointment",
            "id": "a1",
            "status": "noshow",
            "start": "2026-05-01T09:00:00+02:00",
            "end": "2026-05-01T09:50:00+02:00",
            "comment": "Follow-up",
            "participant": [
                {"actor": {"reference": "Practitioner/dr1"}},
                {"actor": {"reference": "Patient/p7"}}
            ]
        }))
        .unwrap();

        assert_eq!(appt.patient_id(), Some("p7"));
        let record = appt.to_record(3, Some(11)).unwrap();
        assert_eq!(record.status, SessionStatus::NoShow);
        assert_eq!(record.start, "2026-05-01T07:00:00Z");
        assert_eq!(record.end, "2026-05-01T07:50:00Z");
        assert_eq!(record.notes.as_deref(), Some("Follow-up"));
    }

    #[test]
    fn slot_to_record_derives_duration_and_location() {
        let slot: FhirSlot = serde_json::from_value(json!({
            "resourceType": "Slot",
            "id": "s1",
            "status": "free",
            "start": "2026-05-01T09:00:00Z",
            "end": "2026-05-01T09:45:00Z",
            "extension": [
                {"url": "https://example.com/fhir/StructureDefinition/location-type",
                 "valueCode": "telehealth"}
            ]
        }))
        .unwrap();

        let record = slot.to_record(2).unwrap();
        assert_eq!(record.duration_minutes, 45);
        assert_eq!(record.location_type, "telehealth");
        assert!(record.is_bookable);

        let busy = FhirSlot {
            status: "busy".to_string(),
            extension: vec![],
            ..slot
        };
        let record = busy.to_record(2).unwrap();
        assert!(!record.is_bookable);
        assert_eq!(record.location_type, "in_person");
    }
}
