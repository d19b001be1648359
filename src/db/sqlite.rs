// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! SQLite store with typed upsert operations.
//!
//! Provides:
//! - Practitioners (keyed by external id)
//! - Clients (keyed by external id + practitioner, partial updates)
//! - Sessions and availability slots (keyed by external id)
//! - The append-only sync log
//!
//! rusqlite is blocking, so every operation checks a connection out of the
//! pool inside `spawn_blocking`.

use crate::db::{tables, SyncStore};
use crate::error::{AppError, Result};
use crate::models::{
    AvailabilitySlot, Client, ClientRecord, Practitioner, PractitionerRecord, PractitionerRef,
    Session, SessionRecord, SlotRecord, SyncResult, UpsertOutcome,
};
use crate::time_utils::format_utc_rfc3339;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS practitioners (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT UNIQUE,
    name        TEXT NOT NULL,
    email       TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS clients (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id     TEXT NOT NULL,
    practitioner_id INTEGER NOT NULL REFERENCES practitioners(id),
    name            TEXT,
    email           TEXT,
    phone           TEXT,
    birth_date      TEXT,
    UNIQUE (external_id, practitioner_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id     TEXT NOT NULL UNIQUE,
    practitioner_id INTEGER NOT NULL REFERENCES practitioners(id),
    client_id       INTEGER REFERENCES clients(id),
    start_time      TEXT NOT NULL,
    end_time        TEXT NOT NULL,
    status          TEXT NOT NULL,
    notes           TEXT
);

CREATE TABLE IF NOT EXISTS availability_slots (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id      TEXT NOT NULL UNIQUE,
    practitioner_id  INTEGER NOT NULL REFERENCES practitioners(id),
    start_time       TEXT NOT NULL,
    end_time         TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    status           TEXT NOT NULL,
    location_type    TEXT NOT NULL,
    is_bookable      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_availability_slots_practitioner_start
    ON availability_slots (practitioner_id, start_time);

CREATE TABLE IF NOT EXISTS sync_log (
    id                       INTEGER PRIMARY KEY AUTOINCREMENT,
    practitioner_external_id TEXT NOT NULL,
    success                  INTEGER NOT NULL,
    created                  INTEGER NOT NULL,
    updated                  INTEGER NOT NULL,
    deleted                  INTEGER NOT NULL,
    error_count              INTEGER NOT NULL,
    errors                   TEXT NOT NULL,
    duration_ms              INTEGER NOT NULL,
    synced_at                TEXT NOT NULL
);
"#;

/// Pooled SQLite store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open a pool against `database_url` (`sqlite://path`, `sqlite:path` or a bare path).
    pub fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });

        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        tracing::info!(path, pool_size, "Opened SQLite connection pool");
        Ok(Self { pool })
    }

    /// Create the tables this worker writes to, if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.run(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    /// Run a blocking closure on a pooled connection.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Database task failed: {}", e)))?
    }

    // ─── Read helpers ────────────────────────────────────────────

    /// Get a practitioner by external id.
    pub async fn practitioner_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Practitioner>> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, external_id, name, email, is_active
                 FROM practitioners WHERE external_id = ?1",
                params![external_id],
                |row| {
                    Ok(Practitioner {
                        id: row.get(0)?,
                        external_id: row.get(1)?,
                        name: row.get(2)?,
                        email: row.get(3)?,
                        is_active: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(AppError::from)
        })
        .await
    }

    /// All clients of a practitioner, ordered by local id.
    pub async fn clients_for(&self, practitioner_id: i64) -> Result<Vec<Client>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, practitioner_id, name, email, phone, birth_date
                 FROM clients WHERE practitioner_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![practitioner_id], |row| {
                Ok(Client {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    practitioner_id: row.get(2)?,
                    name: row.get(3)?,
                    email: row.get(4)?,
                    phone: row.get(5)?,
                    birth_date: row.get(6)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    /// All sessions of a practitioner, ordered by start time.
    pub async fn sessions_for(&self, practitioner_id: i64) -> Result<Vec<Session>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, practitioner_id, client_id, start_time, end_time,
                        status, notes
                 FROM sessions WHERE practitioner_id = ?1 ORDER BY start_time, id",
            )?;
            let rows = stmt.query_map(params![practitioner_id], |row| {
                Ok(Session {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    practitioner_id: row.get(2)?,
                    client_id: row.get(3)?,
                    start: row.get(4)?,
                    end: row.get(5)?,
                    status: row.get(6)?,
                    notes: row.get(7)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    /// All availability slots of a practitioner, ordered by start time.
    pub async fn slots_for(&self, practitioner_id: i64) -> Result<Vec<AvailabilitySlot>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, practitioner_id, start_time, end_time,
                        duration_minutes, status, location_type, is_bookable
                 FROM availability_slots WHERE practitioner_id = ?1 ORDER BY start_time, id",
            )?;
            let rows = stmt.query_map(params![practitioner_id], |row| {
                Ok(AvailabilitySlot {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    practitioner_id: row.get(2)?,
                    start: row.get(3)?,
                    end: row.get(4)?,
                    duration_minutes: row.get(5)?,
                    status: row.get(6)?,
                    location_type: row.get(7)?,
                    is_bookable: row.get(8)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    /// Row count of one of the known tables.
    pub async fn count_rows(&self, table: &'static str) -> Result<i64> {
        let known = [
            tables::PRACTITIONERS,
            tables::CLIENTS,
            tables::SESSIONS,
            tables::AVAILABILITY_SLOTS,
            tables::SYNC_LOG,
        ];
        if !known.contains(&table) {
            return Err(AppError::Database(format!("Unknown table: {}", table)));
        }

        self.run(move |conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(AppError::from)
        })
        .await
    }
}

/// Look up an existing id, then run an `INSERT .. ON CONFLICT .. RETURNING id`.
fn upsert_returning(
    conn: &Connection,
    existing_sql: &str,
    existing_params: &[&dyn rusqlite::ToSql],
    upsert_sql: &str,
    upsert_params: &[&dyn rusqlite::ToSql],
) -> Result<UpsertOutcome> {
    let existing: Option<i64> = conn
        .query_row(existing_sql, existing_params, |row| row.get(0))
        .optional()?;
    let id: i64 = conn.query_row(upsert_sql, upsert_params, |row| row.get(0))?;

    Ok(UpsertOutcome {
        id,
        created: existing.is_none(),
    })
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn list_active_practitioners(&self) -> Result<Vec<PractitionerRef>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, name FROM practitioners
                 WHERE is_active = 1 AND external_id IS NOT NULL AND external_id <> ''
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PractitionerRef {
                    id: row.get(0)?,
                    external_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(AppError::from)
        })
        .await
    }

    async fn upsert_practitioner(&self, record: &PractitionerRecord) -> Result<UpsertOutcome> {
        let r = record.clone();
        self.run(move |conn| {
            upsert_returning(
                conn,
                "SELECT id FROM practitioners WHERE external_id = ?1",
                params![r.external_id],
                "INSERT INTO practitioners (external_id, name, email, is_active)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(external_id) DO UPDATE SET
                     name = excluded.name,
                     email = COALESCE(excluded.email, practitioners.email),
                     is_active = excluded.is_active
                 RETURNING id",
                params![r.external_id, r.name, r.email, r.is_active],
            )
        })
        .await
    }

    async fn upsert_client(&self, record: &ClientRecord) -> Result<UpsertOutcome> {
        let r = record.clone();
        self.run(move |conn| {
            upsert_returning(
                conn,
                "SELECT id FROM clients WHERE external_id = ?1 AND practitioner_id = ?2",
                params![r.external_id, r.practitioner_id],
                "INSERT INTO clients (external_id, practitioner_id, name, email, phone, birth_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(external_id, practitioner_id) DO UPDATE SET
                     name = COALESCE(excluded.name, clients.name),
                     email = COALESCE(excluded.email, clients.email),
                     phone = COALESCE(excluded.phone, clients.phone),
                     birth_date = COALESCE(excluded.birth_date, clients.birth_date)
                 RETURNING id",
                params![
                    r.external_id,
                    r.practitioner_id,
                    r.name,
                    r.email,
                    r.phone,
                    r.birth_date
                ],
            )
        })
        .await
    }

    async fn find_client_id(
        &self,
        external_id: &str,
        practitioner_id: i64,
    ) -> Result<Option<i64>> {
        let external_id = external_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "SELECT id FROM clients WHERE external_id = ?1 AND practitioner_id = ?2",
                params![external_id, practitioner_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(AppError::from)
        })
        .await
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<UpsertOutcome> {
        let r = record.clone();
        self.run(move |conn| {
            upsert_returning(
                conn,
                "SELECT id FROM sessions WHERE external_id = ?1",
                params![r.external_id],
                "INSERT INTO sessions
                     (external_id, practitioner_id, client_id, start_time, end_time, status, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(external_id) DO UPDATE SET
                     practitioner_id = excluded.practitioner_id,
                     client_id = COALESCE(excluded.client_id, sessions.client_id),
                     start_time = excluded.start_time,
                     end_time = excluded.end_time,
                     status = excluded.status,
                     notes = excluded.notes
                 RETURNING id",
                params![
                    r.external_id,
                    r.practitioner_id,
                    r.client_id,
                    r.start,
                    r.end,
                    r.status.as_str(),
                    r.notes
                ],
            )
        })
        .await
    }

    async fn delete_past_slots(&self, practitioner_id: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = format_utc_rfc3339(now);
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM availability_slots WHERE practitioner_id = ?1 AND start_time < ?2",
                params![practitioner_id, cutoff],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn upsert_slot(&self, record: &SlotRecord) -> Result<UpsertOutcome> {
        let r = record.clone();
        self.run(move |conn| {
            upsert_returning(
                conn,
                "SELECT id FROM availability_slots WHERE external_id = ?1",
                params![r.external_id],
                "INSERT INTO availability_slots
                     (external_id, practitioner_id, start_time, end_time, duration_minutes,
                      status, location_type, is_bookable)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(external_id) DO UPDATE SET
                     practitioner_id = excluded.practitioner_id,
                     start_time = excluded.start_time,
                     end_time = excluded.end_time,
                     duration_minutes = excluded.duration_minutes,
                     status = excluded.status,
                     location_type = excluded.location_type,
                     is_bookable = excluded.is_bookable
                 RETURNING id",
                params![
                    r.external_id,
                    r.practitioner_id,
                    r.start,
                    r.end,
                    r.duration_minutes,
                    r.status,
                    r.location_type,
                    r.is_bookable
                ],
            )
        })
        .await
    }

    async fn record_sync_log(
        &self,
        practitioner_external_id: &str,
        result: &SyncResult,
    ) -> Result<()> {
        let external_id = practitioner_external_id.to_string();
        let errors = serde_json::to_string(&result.errors)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JSON error: {}", e)))?;
        let r = result.clone();
        let synced_at = format_utc_rfc3339(Utc::now());

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sync_log
                     (practitioner_external_id, success, created, updated, deleted,
                      error_count, errors, duration_ms, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    external_id,
                    r.success,
                    r.created,
                    r.updated,
                    r.deleted,
                    r.errors.len() as i64,
                    errors,
                    r.duration_ms as i64,
                    synced_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
