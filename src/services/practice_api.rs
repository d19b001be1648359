// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! FHIR client for the practice-management API.
//!
//! Handles:
//! - Bearer authentication via the shared [`TokenManager`]
//! - One retry after a 401 with a freshly fetched token
//! - Per-minute request budget
//! - Bundle pagination via `link[relation=next]`

use crate::error::{AppError, Result};
use crate::services::fhir::{
    Bundle, FhirAppointment, FhirPatient, FhirPractitioner, FhirResource, FhirSlot,
};
use crate::services::rate_limit::RateLimiter;
use crate::services::token::TokenManager;
use crate::time_utils::{format_search_date, format_utc_rfc3339};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use std::collections::HashSet;
use std::sync::Arc;

const FHIR_JSON: &str = "application/fhir+json";

/// Upper bound on pages followed for one search.
const MAX_PAGES: usize = 500;

/// Read-only view of the practice-management API used by the sync pipeline.
#[async_trait]
pub trait PracticeApi: Send + Sync {
    /// All active practitioners.
    async fn fetch_practitioners(&self) -> Result<Vec<FhirPractitioner>>;

    async fn fetch_practitioner(&self, id: &str) -> Result<FhirPractitioner>;

    /// Patients whose general practitioner is `practitioner_id`.
    async fn fetch_patients(&self, practitioner_id: &str) -> Result<Vec<FhirPatient>>;

    /// Appointments dated in `[from, to)`.
    async fn fetch_appointments(
        &self,
        practitioner_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FhirAppointment>>;

    /// Slots starting in `[from, to]`.
    async fn fetch_slots(
        &self,
        practitioner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FhirSlot>>;
}

/// HTTP implementation of [`PracticeApi`].
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
}

impl FhirClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            limiter,
        }
    }

    /// Run a search and collect valid entries from every page.
    async fn search<R: FhirResource>(&self, query: &[(&str, String)]) -> Result<Vec<R>> {
        let mut url = format!("{}/{}", self.base_url, R::RESOURCE_TYPE);
        let mut query = Some(query);
        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for page in 1..=MAX_PAGES {
            let response = self.get(&url, query.take()).await?;
            let bundle: Bundle = response
                .json()
                .await
                .map_err(|e| AppError::ExternalApi(format!("Failed to parse bundle: {}", e)))?;

            let next = bundle.next_link().map(str::to_string);
            let entries = bundle.valid_entries::<R>(&mut seen);
            tracing::debug!(
                resource_type = R::RESOURCE_TYPE,
                page,
                entries = entries.len(),
                "Fetched bundle page"
            );
            results.extend(entries);

            match next {
                Some(next) if next != url => url = next,
                _ => return Ok(results),
            }
        }

        tracing::warn!(
            resource_type = R::RESOURCE_TYPE,
            max_pages = MAX_PAGES,
            "Stopped following pagination links"
        );
        Ok(results)
    }

    /// Authorized GET with one retry on 401.
    async fn get(&self, url: &str, query: Option<&[(&str, String)]>) -> Result<reqwest::Response> {
        let response = self.send(url, query).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_response(response).await;
        }

        tracing::info!(url, "Access token rejected, retrying with a new token");
        self.tokens.invalidate().await;

        let retry = self.send(url, query).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            tracing::error!(url, "Access token rejected after refresh");
            return Err(AppError::Unauthorized);
        }
        check_response(retry).await
    }

    async fn send(&self, url: &str, query: Option<&[(&str, String)]>) -> Result<reqwest::Response> {
        let token = self.tokens.get_token().await?;
        self.limiter.acquire().await;

        let mut request = self
            .http
            .get(url)
            .bearer_auth(&token.value)
            .header(reqwest::header::ACCEPT, FHIR_JSON);
        if let Some(query) = query {
            request = request.query(query);
        }

        request
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(e.to_string()))
    }
}

/// Map non-success statuses to errors.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::NOT_FOUND => Err(AppError::NotFound(url)),
        StatusCode::TOO_MANY_REQUESTS => {
            tracing::warn!(url = %url, "Practice API rate limit hit (429)");
            Err(AppError::ExternalApi(format!("Rate limited: {}", body)))
        }
        _ => Err(AppError::ExternalApi(format!("HTTP {}: {}", status, body))),
    }
}

fn practitioner_reference(id: &str) -> String {
    format!("Practitioner/{}", id)
}

#[async_trait]
impl PracticeApi for FhirClient {
    async fn fetch_practitioners(&self) -> Result<Vec<FhirPractitioner>> {
        self.search(&[("active", "true".to_string())]).await
    }

    async fn fetch_practitioner(&self, id: &str) -> Result<FhirPractitioner> {
        let url = format!(
            "{}/{}/{}",
            self.base_url,
            FhirPractitioner::RESOURCE_TYPE,
            urlencoding::encode(id)
        );
        let value: serde_json::Value = self
            .get(&url, None)
            .await?
            .json()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Failed to parse practitioner: {}", e)))?;

        let resource_type = value
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if resource_type != FhirPractitioner::RESOURCE_TYPE {
            return Err(AppError::InvalidResource(format!(
                "Expected Practitioner {}, got {}",
                id, resource_type
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| AppError::InvalidResource(format!("Practitioner {}: {}", id, e)))
    }

    async fn fetch_patients(&self, practitioner_id: &str) -> Result<Vec<FhirPatient>> {
        self.search(&[("general-practitioner", practitioner_reference(practitioner_id))])
            .await
    }

    async fn fetch_appointments(
        &self,
        practitioner_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FhirAppointment>> {
        self.search(&[
            ("practitioner", practitioner_reference(practitioner_id)),
            ("date", format!("ge{}", format_search_date(from))),
            ("date", format!("lt{}", format_search_date(to))),
        ])
        .await
    }

    async fn fetch_slots(
        &self,
        practitioner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FhirSlot>> {
        self.search(&[
            ("schedule.actor", practitioner_reference(practitioner_id)),
            ("start", format!("ge{}", format_utc_rfc3339(from))),
            ("start", format!("le{}", format_utc_rfc3339(to))),
        ])
        .await
    }
}
