// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the coordinator HTTP API.
//!
//! Uses `axum_test::TestServer` — no real TCP, Postgres, or Redis needed.

use std::sync::Arc;
use std::time::Instant;

use axum_test::TestServer;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use tokio_util::sync::CancellationToken;

use attend_coordinator::cache::SharedCache;
use attend_coordinator::config::CoordinatorConfig;
use attend_coordinator::coordinator::Coordinator;
use attend_coordinator::devicebinding::{DeviceBindingCache, IdentitySource};
use attend_coordinator::group::GroupCoordinator;
use attend_coordinator::identity::{Identity, StudentRef};
use attend_coordinator::model::{FacultyRef, SessionMode, Triple};
use attend_coordinator::room::RoomRegistry;
use attend_coordinator::rotator::RotatorTable;
use attend_coordinator::store::InMemorySessionStore;
use attend_coordinator::token::TokenMint;
use attend_coordinator::transport::build_router;
use attend_coordinator::AppState;

const TEST_SECRET: &str = "integration-test-secret";

struct NoopIdentitySource;

#[async_trait::async_trait]
impl IdentitySource for NoopIdentitySource {
    async fn section_fingerprints(&self, _triple: &Triple) -> anyhow::Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        host: "127.0.0.1".into(),
        port: 0,
        frontend_url: Vec::new(),
        db_uri: String::new(),
        jwt_secret: TEST_SECRET.into(),
        redis_url: String::new(),
        nats_url: String::new(),
        nats_prefix: "attend-test".into(),
        token_rotate_secs: 5,
        token_window_secs: 7,
        membership_ttl_secs: 7200,
        section_cache_ttl_secs: 300,
        call_deadline_ms: 3000,
        rotator_deadline_ms: 1000,
        rotator_stale_secs: 15,
        cluster_worker: None,
    }
}

fn test_state() -> Arc<AppState> {
    let config = test_config();
    let tokens = Arc::new(TokenMint::new(&config.jwt_secret, config.token_window()));
    let bindings = Arc::new(DeviceBindingCache::new(Arc::new(NoopIdentitySource), config.section_cache_ttl()));
    // A live, process-local Shared Cache rather than `disabled()`: these
    // tests exercise real dedup/idempotency behavior, which a permanently
    // degraded cache can never surface (every membership check degrades to
    // a fixed default, per spec §4.2's fallback discipline).
    let coordinator = Coordinator {
        store: Arc::new(InMemorySessionStore::default()),
        cache: Arc::new(SharedCache::in_memory()),
        bindings,
        tokens: Arc::clone(&tokens),
        membership_ttl: config.membership_ttl(),
    };
    let group = GroupCoordinator { single: coordinator.clone(), tokens };

    Arc::new(AppState {
        identity_key: hmac::Key::new(hmac::HMAC_SHA256, config.jwt_secret.as_bytes()),
        config,
        coordinator,
        group,
        rooms: RoomRegistry::new(),
        fabric: None,
        rotators: Arc::new(RotatorTable::new()),
        worker_id: "test-worker".into(),
        started_at: Instant::now(),
        shutdown: CancellationToken::new(),
    })
}

fn test_server(state: Arc<AppState>) -> TestServer {
    let router = build_router(state);
    TestServer::new(router).expect("failed to create test server")
}

/// Signs an [`Identity`] into the same bearer-credential shape
/// `identity::resolve_bearer` expects: base64url(payload).base64url(sig).
fn bearer_for(state: &AppState, identity: &Identity) -> String {
    let payload = serde_json::to_vec(identity).expect("identity serializes");
    let sig = hmac::sign(&state.identity_key, &payload);
    format!("Bearer {}.{}", URL_SAFE_NO_PAD.encode(&payload), URL_SAFE_NO_PAD.encode(sig.as_ref()))
}

/// Pulls a string field out of a JSON body, the way callers need it for
/// query params and subsequent request paths.
fn field_str<'a>(value: &'a serde_json::Value, field: &str) -> anyhow::Result<&'a str> {
    value[field].as_str().ok_or_else(|| anyhow::anyhow!("missing or non-string field `{field}`"))
}

fn faculty() -> FacultyRef {
    FacultyRef { faculty_id: "f-1".into(), display_name: "Dr. Okafor".into(), email: "okafor@example.edu".into() }
}

fn student(triple: &Triple) -> StudentRef {
    StudentRef {
        student_id: "s-1".into(),
        roll_number: "07".into(),
        triple: triple.clone(),
        email: "student@example.edu".into(),
        fingerprint: None,
    }
}

fn triple() -> Triple {
    Triple::new("CS", "2026A", "01")
}

#[tokio::test]
async fn status_is_open_without_a_credential() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let resp = server.get("/status").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn protected_route_without_bearer_is_rejected() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let resp = server
        .post("/qr/start-session")
        .json(&serde_json::json!({
            "department": "CS", "semester": "2026A", "section": "01",
            "expectedSize": 30, "mode": "roll_based",
        }))
        .await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn faculty_lifecycle_reaches_active_and_accepts_a_scan() -> anyhow::Result<()> {
    let state = test_state();
    let bearer = bearer_for(&state, &Identity::Faculty(faculty()));
    let student_bearer = bearer_for(&state, &Identity::Student(student(&triple())));
    let server = test_server(Arc::clone(&state));

    let start = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({
            "department": "CS", "semester": "2026A", "section": "01",
            "expectedSize": 30, "mode": "roll_based",
        }))
        .await;
    start.assert_status_ok();
    let session: serde_json::Value = start.json();
    let session_id = field_str(&session, "id")?.to_owned();
    assert_eq!(session["status"], "CREATED");

    // A student joins before the session locks.
    let join = server
        .post("/qr/join-session")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await;
    join.assert_status_ok();
    assert_eq!(join.json::<serde_json::Value>()["alreadyJoined"], false);

    let lock = server
        .post("/qr/lock-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await;
    lock.assert_status_ok();
    assert_eq!(lock.json::<serde_json::Value>()["status"], "LOCKED");

    let started = server
        .post("/qr/start-attendance")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await;
    started.assert_status_ok();
    let started_body: serde_json::Value = started.json();
    assert_eq!(started_body["status"], "ACTIVE");
    let token = field_str(&started_body, "currentToken")?.to_owned();

    let scan = server
        .post("/qr/scan-qr")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id, "token": token, "fingerprint": "device-a" }))
        .await;
    scan.assert_status_ok();
    assert_eq!(scan.json::<serde_json::Value>()["alreadyMarked"], false);

    // A second scan of the same roll number is rejected as a duplicate.
    let rescan = server
        .post("/qr/scan-qr")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id, "token": token, "fingerprint": "device-a" }))
        .await;
    rescan.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let ended = server
        .post("/qr/end-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await;
    ended.assert_status_ok();
    let ended_body: serde_json::Value = ended.json();
    assert_eq!(ended_body["session"]["status"], "ENDED");
    assert_eq!(ended_body["record"]["present"], serde_json::json!(["07"]));
    Ok(())
}

#[tokio::test]
async fn second_scan_of_an_already_marked_roll_number_is_rejected() -> anyhow::Result<()> {
    let state = test_state();
    let bearer = bearer_for(&state, &Identity::Faculty(faculty()));
    let student_bearer = bearer_for(&state, &Identity::Student(student(&triple())));
    // A second credential sharing the same roll number as the first, the
    // way a re-registered or duplicated student record would (spec §4.5
    // "attended" tracks by roll number, not student id).
    let duplicate_bearer = bearer_for(
        &state,
        &Identity::Student(StudentRef {
            student_id: "s-2".into(),
            roll_number: "07".into(),
            triple: triple(),
            email: "other@example.edu".into(),
            fingerprint: None,
        }),
    );
    let server = test_server(Arc::clone(&state));

    let start = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({
            "department": "CS", "semester": "2026A", "section": "01",
            "expectedSize": 30, "mode": "roll_based",
        }))
        .await;
    let session_id = field_str(&start.json(), "id")?.to_owned();

    for bearer in [&student_bearer, &duplicate_bearer] {
        server
            .post("/qr/join-session")
            .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
            .json(&serde_json::json!({ "sessionId": session_id }))
            .await
            .assert_status_ok();
    }

    server
        .post("/qr/lock-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await
        .assert_status_ok();

    let started = server
        .post("/qr/start-attendance")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await;
    let token = field_str(&started.json(), "currentToken")?.to_owned();

    server
        .post("/qr/scan-qr")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id, "token": token, "fingerprint": "device-a" }))
        .await
        .assert_status_ok();

    let resp = server
        .post("/qr/scan-qr")
        .add_header(axum::http::header::AUTHORIZATION, duplicate_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id, "token": token, "fingerprint": "device-b" }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn expired_or_garbage_token_is_rejected_with_gone() -> anyhow::Result<()> {
    let state = test_state();
    let bearer = bearer_for(&state, &Identity::Faculty(faculty()));
    let student_bearer = bearer_for(&state, &Identity::Student(student(&triple())));
    let server = test_server(Arc::clone(&state));

    let start = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({
            "department": "CS", "semester": "2026A", "section": "01",
            "expectedSize": 30, "mode": "roll_based",
        }))
        .await;
    let session_id = field_str(&start.json(), "id")?.to_owned();

    server
        .post("/qr/join-session")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await
        .assert_status_ok();

    server
        .post("/qr/lock-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await
        .assert_status_ok();

    server
        .post("/qr/start-attendance")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await
        .assert_status_ok();

    let resp = server
        .post("/qr/scan-qr")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id, "token": "not-a-real-token", "fingerprint": "device-a" }))
        .await;
    resp.assert_status(axum::http::StatusCode::GONE);
    Ok(())
}

#[tokio::test]
async fn proxy_gate_removes_student_from_both_sets() -> anyhow::Result<()> {
    let state = test_state();
    let bearer = bearer_for(&state, &Identity::Faculty(faculty()));
    let student_ref = student(&triple());
    let student_bearer = bearer_for(&state, &Identity::Student(student_ref.clone()));
    let server = test_server(Arc::clone(&state));

    let start = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&serde_json::json!({
            "department": "CS", "semester": "2026A", "section": "01",
            "expectedSize": 30, "mode": "roll_based",
        }))
        .await;
    let session_id = field_str(&start.json(), "id")?.to_owned();

    server
        .post("/qr/join-session")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({ "sessionId": session_id }))
        .await
        .assert_status_ok();

    let removal = server
        .post("/proxy/remove-student")
        .add_header(axum::http::header::AUTHORIZATION, student_bearer.parse()?)
        .json(&serde_json::json!({
            "studentId": student_ref.student_id,
            "rollNumber": student_ref.roll_number,
            "department": "CS", "semester": "2026A", "section": "01",
            "reason": "left by mistake",
        }))
        .await;
    removal.assert_status_ok();
    assert_eq!(removal.json::<serde_json::Value>()["removedFromJoined"], true);
    Ok(())
}

#[tokio::test]
async fn start_session_ends_a_non_ended_sibling_for_the_same_triple() -> anyhow::Result<()> {
    let state = test_state();
    let bearer = bearer_for(&state, &Identity::Faculty(faculty()));
    let server = test_server(Arc::clone(&state));

    let body = serde_json::json!({
        "department": "CS", "semester": "2026A", "section": "01",
        "expectedSize": 30, "mode": "roll_based",
    });

    let first = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&body)
        .await;
    let first_id = field_str(&first.json(), "id")?.to_owned();

    let second = server
        .post("/qr/start-session")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .json(&body)
        .await;
    second.assert_status_ok();

    let status = server
        .get("/qr/session-status")
        .add_header(axum::http::header::AUTHORIZATION, bearer.parse()?)
        .add_query_param("sessionId", &first_id)
        .await;
    status.assert_status_ok();
    assert_eq!(status.json::<serde_json::Value>()["status"], "ENDED");
    Ok(())
}
