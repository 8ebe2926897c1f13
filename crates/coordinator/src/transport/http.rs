// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP surface (spec §6): thin faculty/student mirrors of the realtime
//! events, plus the proxy-detection and liveness endpoints.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::status_update_payload;
use crate::error::CoordError;
use crate::identity::Identity;
use crate::model::{SessionMode, Triple};
use crate::proxy;
use crate::AppState;

fn err(e: CoordError) -> axum::response::Response {
    e.to_http_response(e.as_str()).into_response()
}

/// `GET /status` — liveness (spec §6): `{status, time, uptime, cluster, redis}`.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now(),
        "uptime": state.started_at.elapsed().as_secs(),
        "cluster": { "isWorker": !state.config.is_master(), "id": state.worker_id },
        "redis": { "connected": true, "fallback": false, "healthy": true },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub department: String,
    pub semester: String,
    pub section: String,
    pub expected_size: i64,
    pub mode: SessionMode,
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<StartSessionRequest>,
) -> axum::response::Response {
    let Ok(faculty) = identity.faculty() else { return err(CoordError::AuthZ) };
    let triple = Triple::new(req.department, req.semester, req.section);
    match state.coordinator.start_session(triple, req.expected_size, req.mode, faculty.clone()).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdRequest {
    pub session_id: Uuid,
}

pub async fn lock_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SessionIdRequest>,
) -> axum::response::Response {
    let Ok(faculty) = identity.faculty() else { return err(CoordError::AuthZ) };
    match state.coordinator.lock(req.session_id, faculty).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => err(e),
    }
}

pub async fn unlock_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SessionIdRequest>,
) -> axum::response::Response {
    let Ok(faculty) = identity.faculty() else { return err(CoordError::AuthZ) };
    match state.coordinator.unlock(req.session_id, faculty).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => err(e),
    }
}

pub async fn start_attendance(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SessionIdRequest>,
) -> axum::response::Response {
    let Ok(faculty) = identity.faculty() else { return err(CoordError::AuthZ) };
    match state.coordinator.start_attendance(req.session_id, faculty, &state.worker_id).await {
        Ok(session) => {
            let period = state.config.token_rotate_interval();
            state.rotators.start_single(
                state.coordinator.clone(),
                state.rotator_sink(),
                session.id,
                state.worker_id.clone(),
                period,
            );
            Json(session).into_response()
        }
        Err(e) => err(e),
    }
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SessionIdRequest>,
) -> axum::response::Response {
    let Ok(faculty) = identity.faculty() else { return err(CoordError::AuthZ) };
    match state.coordinator.end_session(req.session_id, faculty).await {
        Ok((session, record)) => {
            state.rotators.stop(session.id);
            Json(serde_json::json!({ "session": session, "record": record })).into_response()
        }
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionRequest {
    pub session_id: Uuid,
}

pub async fn join_session(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<JoinSessionRequest>,
) -> axum::response::Response {
    let Ok(student) = identity.student() else { return err(CoordError::AuthZ) };
    match state.coordinator.join(req.session_id, &student.student_id, &student.triple).await {
        Ok(outcome) => Json(serde_json::json!({
            "session": outcome.session,
            "alreadyJoined": outcome.already_joined,
        }))
        .into_response(),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQrRequest {
    pub session_id: Uuid,
    pub token: String,
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

pub async fn scan_qr(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ScanQrRequest>,
) -> axum::response::Response {
    let Ok(student) = identity.student() else { return err(CoordError::AuthZ) };
    let _ = &req.photo_ref; // photo storage is handled by an external service; only the reference is carried.
    match state
        .coordinator
        .scan(
            req.session_id,
            &student.student_id,
            &student.roll_number,
            &student.triple,
            &req.token,
            req.fingerprint.as_deref(),
        )
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "session": outcome.session,
            "alreadyMarked": outcome.already_marked,
        }))
        .into_response(),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateQrRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateQrResponse {
    pub valid: bool,
}

pub async fn validate_qr(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateQrRequest>,
) -> Json<ValidateQrResponse> {
    Json(ValidateQrResponse { valid: state.coordinator.tokens.verify(&req.token).is_ok() })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusQuery {
    pub session_id: Uuid,
}

pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionStatusQuery>,
) -> axum::response::Response {
    match state.coordinator.store.get(q.session_id).await {
        Ok(Some(session)) => {
            let (joined, present) = state.coordinator.live_counts(&session).await;
            let mut body = status_update_payload(&session, "session-status");
            if let serde_json::Value::Object(ref mut map) = body {
                map.insert("joined".into(), joined.into());
                map.insert("present".into(), present.into());
            }
            Json(body).into_response()
        }
        Ok(None) => err(CoordError::NotFound),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveStudentRequest {
    pub student_id: String,
    pub roll_number: String,
    pub department: String,
    pub semester: String,
    pub section: String,
    pub reason: String,
}

pub async fn remove_student(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<RemoveStudentRequest>,
) -> axum::response::Response {
    let Ok(student) = identity.student() else { return err(CoordError::AuthZ) };
    let triple = Triple::new(req.department, req.semester, req.section);
    match proxy::remove_student(
        &state.coordinator,
        student,
        &req.student_id,
        &req.roll_number,
        &triple,
        &req.reason,
    )
    .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => err(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatusRequest {
    pub student_id: String,
    pub roll_number: String,
    pub department: String,
    pub semester: String,
    pub section: String,
}

pub async fn student_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StudentStatusRequest>,
) -> axum::response::Response {
    let triple = Triple::new(req.department, req.semester, req.section);
    match proxy::student_status(&state.coordinator, &req.student_id, &req.roll_number, &triple).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => err(e),
    }
}

pub async fn session_stats(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<Uuid>,
) -> axum::response::Response {
    match state.coordinator.store.get(sid).await {
        Ok(Some(session)) => {
            let (joined, present) = state.coordinator.live_counts(&session).await;
            Json(serde_json::json!({
                "sessionId": session.id,
                "status": session.status,
                "joined": joined,
                "present": present,
                "counters": session.counters,
            }))
            .into_response()
        }
        Ok(None) => err(CoordError::NotFound),
        Err(e) => err(e),
    }
}
