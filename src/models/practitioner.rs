//! Practitioner model.

use serde::{Deserialize, Serialize};

/// Practitioner row in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Practitioner {
    /// Local primary key
    pub id: i64,
    /// Identifier in the practice-management system (None for local-only rows)
    pub external_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub is_active: bool,
}

/// Incoming practitioner data, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct PractitionerRecord {
    pub external_id: String,
    pub name: String,
    pub email: Option<String>,
    pub is_active: bool,
}

/// Active practitioner selected for a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PractitionerRef {
    pub id: i64,
    pub external_id: String,
    pub name: String,
}
