// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! FHIR client tests against a mock practice API.
//!
//! These tests verify that:
//! 1. Pagination follows `next` links and unions pages without duplicates
//! 2. Noise entries (placeholders, OperationOutcome) are dropped
//! 3. A 401 refreshes the token and retries exactly once

use chrono::NaiveDate;
use practice_sync::error::AppError;
use practice_sync::services::{FhirClient, PracticeApi, RateLimiter, TokenManager};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_token(server: &MockServer, token: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": 3600
        })))
        .up_to_n_times(times)
        .expect(times)
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> FhirClient {
    let http = reqwest::Client::new();
    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        format!("{}/oauth/token", server.uri()),
        "client".to_string(),
        "secret".to_string(),
        None,
    ));
    FhirClient::new(
        http,
        format!("{}/fhir/", server.uri()),
        tokens,
        RateLimiter::per_minute(600),
    )
}

fn patient(id: &str) -> Value {
    json!({"resource": {"resourceType": "Patient", "id": id}})
}

fn bundle(entries: Vec<Value>, next: Option<String>) -> Value {
    let mut link = vec![json!({"relation": "self", "url": "ignored"})];
    if let Some(next) = next {
        link.push(json!({"relation": "next", "url": next}));
    }
    json!({"resourceType": "Bundle", "type": "searchset", "link": link, "entry": entries})
}

#[tokio::test]
async fn test_pagination_unions_pages_without_duplicates() {
    let server = MockServer::start().await;
    mount_token(&server, "tok", 1).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Patient"))
        .and(query_param("general-practitioner", "Practitioner/dr-1"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle(
            vec![
                patient("p1"),
                patient("p2"),
                json!({"resource": {"resourceType": "OperationOutcome", "issue": []}}),
            ],
            Some(format!("{}/fhir/_page/2", server.uri())),
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/_page/2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle(
            vec![patient("p2"), patient("placeholder"), patient("p3")],
            Some(format!("{}/fhir/_page/3", server.uri())),
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/_page/3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle(
            vec![patient("p4"), json!({"resource": {"resourceType": "Patient", "id": ""}})],
            None,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let patients = client(&server).fetch_patients("dr-1").await.unwrap();
    let ids: Vec<&str> = patients.iter().map(|p| p.id.as_str()).collect();

    assert_eq!(ids, vec!["p1", "p2", "p3", "p4"]);
}

#[tokio::test]
async fn test_appointment_search_uses_date_window() {
    let server = MockServer::start().await;
    mount_token(&server, "tok", 1).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Appointment"))
        .and(query_param("practitioner", "Practitioner/dr-1"))
        .and(query_param("date", "ge2026-03-01"))
        .and(query_param("date", "lt2026-05-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bundle(vec![], None)))
        .expect(1)
        .mount(&server)
        .await;

    let from = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
    let appointments = client(&server)
        .fetch_appointments("dr-1", from, to)
        .await
        .unwrap();
    assert!(appointments.is_empty());
}

#[tokio::test]
async fn test_unauthorized_retries_once_with_new_token() {
    let server = MockServer::start().await;
    mount_token(&server, "stale", 1).await;
    mount_token(&server, "fresh", 1).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Practitioner/dr-1"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/Practitioner/dr-1"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Practitioner",
            "id": "dr-1",
            "name": [{"text": "Dr. Ada Byron"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let practitioner = client(&server).fetch_practitioner("dr-1").await.unwrap();
    assert_eq!(practitioner.id, "dr-1");
}

#[tokio::test]
async fn test_second_unauthorized_is_an_auth_error() {
    let server = MockServer::start().await;
    mount_token(&server, "tok", 2).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Practitioner"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let err = client(&server).fetch_practitioners().await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized));
    assert!(err.is_auth_error());
}

#[tokio::test]
async fn test_missing_practitioner_is_not_found() {
    let server = MockServer::start().await;
    mount_token(&server, "tok", 1).await;

    Mock::given(method("GET"))
        .and(path("/fhir/Practitioner/ghost"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "not-found"}]
        })))
        .mount(&server)
        .await;

    let err = client(&server).fetch_practitioner("ghost").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
