// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-pass sync bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity a sync error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Practitioner,
    Client,
    Session,
    Availability,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Practitioner => "practitioner",
            EntityType::Client => "client",
            EntityType::Session => "session",
            EntityType::Availability => "availability",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entity that failed to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub message: String,
}

/// Outcome of a single upsert statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Local primary key of the row
    pub id: i64,
    /// True if the row was inserted, false if an existing row was updated
    pub created: bool,
}

/// Result of one sync pass for one practitioner.
///
/// Logged and appended to the sync log; not otherwise persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub errors: Vec<SyncError>,
    pub duration_ms: u64,
}

impl SyncResult {
    /// Count an upsert as created or updated.
    pub fn record_upsert(&mut self, outcome: UpsertOutcome) {
        if outcome.created {
            self.created += 1;
        } else {
            self.updated += 1;
        }
    }

    /// Record a per-entity failure.
    pub fn record_error(
        &mut self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        message: impl fmt::Display,
    ) {
        let entity_id = entity_id.into();
        let message = message.to_string();
        tracing::warn!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            error = %message,
            "Entity failed to sync"
        );
        self.errors.push(SyncError {
            entity_type,
            entity_id,
            message,
        });
    }

    /// Total rows touched by the pass.
    pub fn total_changes(&self) -> u32 {
        self.created + self.updated + self.deleted
    }
}
