// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types shared by the sync worker.

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Token request failed with HTTP {status}: {body}")]
    TokenFetch { status: u16, body: String },

    #[error("Practice API rejected the access token")]
    Unauthorized,

    #[error("Practice API error: {0}")]
    ExternalApi(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Broadcast error: {0}")]
    Broadcast(String),

    #[error("Queue error: {0}")]
    Queue(String),

    /// The work could not run yet; retry later without counting a failure.
    #[error("Deferred: {0}")]
    Deferred(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True for failures of the OAuth token lifecycle.
    ///
    /// These abort the current practitioner pass rather than being recorded
    /// as a per-entity error.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, AppError::TokenFetch { .. } | AppError::Unauthorized)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::Database(format!("Connection pool error: {}", err))
    }
}

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;
