//! Database layer (SQLite via an r2d2 connection pool).

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{
    ClientRecord, PractitionerRecord, PractitionerRef, SessionRecord, SlotRecord, SyncResult,
    UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Table names as constants.
pub mod tables {
    pub const PRACTITIONERS: &str = "practitioners";
    pub const CLIENTS: &str = "clients";
    pub const SESSIONS: &str = "sessions";
    pub const AVAILABILITY_SLOTS: &str = "availability_slots";
    /// Append-only log of sync passes
    pub const SYNC_LOG: &str = "sync_log";
}

/// Write-side gateway used by the sync orchestrator.
///
/// Every write is a single upsert keyed on the entity's natural key; no
/// transaction spans more than one statement.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Active practitioners that have an external identifier configured.
    async fn list_active_practitioners(&self) -> Result<Vec<PractitionerRef>>;

    async fn upsert_practitioner(&self, record: &PractitionerRecord) -> Result<UpsertOutcome>;

    /// Upsert a client; `None` fields keep the stored value.
    async fn upsert_client(&self, record: &ClientRecord) -> Result<UpsertOutcome>;

    /// Resolve a patient's external id to a local client for one practitioner.
    async fn find_client_id(&self, external_id: &str, practitioner_id: i64)
        -> Result<Option<i64>>;

    async fn upsert_session(&self, record: &SessionRecord) -> Result<UpsertOutcome>;

    /// Delete one practitioner's slots starting before `now`.
    async fn delete_past_slots(&self, practitioner_id: i64, now: DateTime<Utc>) -> Result<u64>;

    async fn upsert_slot(&self, record: &SlotRecord) -> Result<UpsertOutcome>;

    /// Append a pass result to the sync log.
    async fn record_sync_log(&self, practitioner_external_id: &str, result: &SyncResult)
        -> Result<()>;

    /// Cheap connectivity check for the health endpoint.
    async fn ping(&self) -> Result<()>;
}
