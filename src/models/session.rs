// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session (appointment) model and status vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Local session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl SessionStatus {
    /// Map a FHIR `Appointment.status` onto the local vocabulary.
    ///
    /// Unknown statuses fall back to `Pending` so a new upstream status
    /// never fails the sync.
    pub fn from_fhir(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "proposed" | "pending" => SessionStatus::Pending,
            "booked" | "arrived" => SessionStatus::Scheduled,
            "fulfilled" => SessionStatus::Completed,
            "cancelled" | "entered-in-error" => SessionStatus::Cancelled,
            "noshow" => SessionStatus::NoShow,
            _ => SessionStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session row in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub external_id: String,
    pub practitioner_id: i64,
    /// Local client, when the appointment's patient has been synced
    pub client_id: Option<i64>,
    /// Start time (RFC3339, UTC)
    pub start: String,
    /// End time (RFC3339, UTC)
    pub end: String,
    pub status: String,
    pub notes: Option<String>,
}

/// Incoming session data, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub external_id: String,
    pub practitioner_id: i64,
    pub client_id: Option<i64>,
    pub start: String,
    pub end: String,
    pub status: SessionStatus,
    pub notes: Option<String>,
}
