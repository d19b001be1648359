//! Availability slot model.

use serde::{Deserialize, Serialize};

/// Availability slot row in the local store.
///
/// Only future slots are retained; past slots are removed at the start of
/// each availability sync for their practitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: i64,
    pub external_id: String,
    pub practitioner_id: i64,
    pub start: String,
    pub end: String,
    pub duration_minutes: i64,
    pub status: String,
    pub location_type: String,
    pub is_bookable: bool,
}

/// Incoming slot data, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRecord {
    pub external_id: String,
    pub practitioner_id: i64,
    pub start: String,
    pub end: String,
    pub duration_minutes: i64,
    pub status: String,
    pub location_type: String,
    pub is_bookable: bool,
}
