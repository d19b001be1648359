// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Token manager tests against a mock OAuth token endpoint.

use practice_sync::error::AppError;
use practice_sync::services::TokenManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn manager(server: &MockServer, scope: Option<&str>) -> TokenManager {
    TokenManager::new(
        reqwest::Client::new(),
        format!("{}/oauth/token", server.uri()),
        "client-123".to_string(),
        "s3cret".to_string(),
        scope.map(str::to_string),
    )
}

fn token_response(token: &str, expires_in: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": expires_in
    }))
}

#[tokio::test]
async fn test_concurrent_callers_share_one_token_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=client-123"))
        .respond_with(token_response("tok-1", 3600).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = Arc::new(manager(&server, None));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let tokens = tokens.clone();
        handles.push(tokio::spawn(async move { tokens.get_token().await }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().value, "tok-1");
    }
}

#[tokio::test]
async fn test_cached_token_is_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("scope=fhir.read"))
        .respond_with(token_response("tok-1", 3600))
        .expect(1)
        .mount(&server)
        .await;

    let tokens = manager(&server, Some("fhir.read"));
    let first = tokens.get_token().await.unwrap();
    let second = tokens.get_token().await.unwrap();
    assert_eq!(first.value, "tok-1");
    assert_eq!(second.value, "tok-1");
    assert_eq!(first.expires_at, second.expires_at);
}

#[tokio::test]
async fn test_token_inside_expiry_buffer_is_refetched() {
    let server = MockServer::start().await;
    // Expires within the safety buffer, so it is never considered fresh.
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token_response("short-lived", 90))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = manager(&server, None);
    tokens.get_token().await.unwrap();
    tokens.get_token().await.unwrap();
}

#[tokio::test]
async fn test_token_expiry_subtracts_safety_buffer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token_response("tok-1", 3600))
        .mount(&server)
        .await;

    let before = Instant::now();
    let token = manager(&server, None).get_token().await.unwrap();
    let after = Instant::now();

    let usable = Duration::from_secs(3600 - 120);
    assert!(token.expires_at >= before + usable);
    assert!(token.expires_at <= after + usable);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token_response("tok-1", 3600))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = manager(&server, None);
    tokens.get_token().await.unwrap();
    tokens.invalidate().await;
    tokens.get_token().await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_surface_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;

    let err = manager(&server, None).get_token().await.unwrap_err();
    match err {
        AppError::TokenFetch { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "invalid_client");
        }
        other => panic!("expected TokenFetch, got {other:?}"),
    }
    assert!(AppError::TokenFetch {
        status: 401,
        body: String::new()
    }
    .is_auth_error());
}
