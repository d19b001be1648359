// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth2 client-credentials token lifecycle for the practice API.

use crate::config::Config;
use crate::error::AppError;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Subtracted from `expires_in` so a token is never used right at expiry.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(120);

/// Bearer token plus the instant after which it must be refreshed.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Caches one access token and serializes refreshes.
///
/// Concurrent callers that find the cache stale queue on the refresh lock;
/// the first one fetches and the rest pick up its token.
pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    cached: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    ) -> Self {
        Self {
            http,
            token_url,
            client_id,
            client_secret,
            scope,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn from_config(http: reqwest::Client, config: &Config) -> Self {
        Self::new(
            http,
            config.api_token_url.clone(),
            config.api_client_id.clone(),
            config.api_client_secret.clone(),
            config.api_scope.clone(),
        )
    }

    /// Return a valid bearer token and its expiry, fetching a new one if needed.
    pub async fn get_token(&self) -> Result<AccessToken, AppError> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let fresh = self.fetch_token().await?;
        *self.cached.write().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        tracing::debug!("Invalidating cached access token");
        *self.cached.write().await = None;
    }

    async fn cached_token(&self) -> Option<AccessToken> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|t| t.is_fresh())
            .cloned()
    }

    async fn fetch_token(&self) -> Result<AccessToken, AppError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = self.scope.as_deref() {
            form.push(("scope", scope));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status, body = %body, "Token endpoint rejected credentials");
            return Err(AppError::TokenFetch { status, body });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::ExternalApi(format!("Failed to parse token response: {}", e)))?;

        let lifetime = Duration::from_secs(parsed.expires_in).saturating_sub(TOKEN_EXPIRY_BUFFER);
        tracing::info!(
            expires_in = parsed.expires_in,
            cached_for_secs = lifetime.as_secs(),
            "Fetched new access token"
        );

        Ok(AccessToken {
            value: parsed.access_token,
            expires_at: Instant::now() + lifetime,
        })
    }
}
