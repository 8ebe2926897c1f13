// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Realtime Bus WebSocket handler (spec §4.7, §6): one socket per client,
//! joined into its faculty/section rooms on connect and fed every event
//! published to them until disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::coordinator::{self, event, status_update_payload};
use crate::error::CoordError;
use crate::identity::Identity;
use crate::model::{FacultyRef, SessionMode, Triple};
use crate::room::status_flags;
use crate::transport::auth;
use crate::AppState;

/// Query parameters for the WS upgrade: the bearer credential travels in
/// `?token=...` since browsers cannot set headers on the handshake request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// `GET /ws` — realtime channel upgrade (spec §6).
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity = match auth::identity_from_query(&state, &format!("token={}", query.token)) {
        Ok(identity) => identity,
        Err(code) => return code.to_http_response("missing or invalid credential").into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity)).into_response()
}

/// Inbound events a client may send (spec §6). Faculty and student events
/// share one envelope; `kind` without a match for the caller's role fails
/// with an `error` event rather than silently ignoring it.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
enum InboundEvent {
    StartSession { department: String, semester: String, section: String, expected_size: i64, mode: SessionMode },
    LockSession { session_id: Uuid },
    UnlockSession { session_id: Uuid },
    StartAttendance { session_id: Uuid },
    EndSession { session_id: Uuid },
    BroadcastJoinAvailable { session_id: Uuid },
    RequestTokenRefresh { session_id: Uuid },
    GroupStartSession { triples: Vec<GroupMemberSpec>, mode: SessionMode },
    GroupLockSession { group_id: Uuid },
    GroupUnlockSession { group_id: Uuid },
    GroupStartAttendance { group_id: Uuid },
    GroupEndSession { group_id: Uuid },
    JoinSession { session_id: Uuid, fingerprint: Option<String> },
    GetSessionStatus { session_id: Uuid },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupMemberSpec {
    department: String,
    semester: String,
    section: String,
    expected_size: i64,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let (mut tx, mut rx) = socket.split();

    // A faculty socket joins only its own room; every section-room event it
    // cares about is mirrored there by `publish_to` below (spec §4.7 "a
    // faculty joins their room plus each of their section rooms" collapses
    // to one subscription since we fan events into both rooms at publish
    // time). A student socket joins its one section room.
    let mut local_rx = match &identity {
        Identity::Faculty(f) => state.rooms.subscribe(&coordinator::faculty_room(&f.faculty_id)),
        Identity::Student(s) => state.rooms.subscribe(&coordinator::section_room(&s.triple)),
    };

    loop {
        tokio::select! {
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &identity, &text, &mut tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = local_rx.recv() => {
                match event {
                    Ok(event) => {
                        let text = serde_json::to_string(&event).unwrap_or_default();
                        if tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn handle_inbound(
    state: &Arc<AppState>,
    identity: &Identity,
    text: &str,
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) {
    let inbound: InboundEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(_) => {
            send_error(tx, CoordError::Validation, "malformed event").await;
            return;
        }
    };

    if let Err(e) = dispatch(state, identity, inbound).await {
        send_error(tx, e, &e.to_string()).await;
    }
}

async fn send_error(tx: &mut futures_util::stream::SplitSink<WebSocket, Message>, code: CoordError, message: &str) {
    let payload = code.to_ws_event(message);
    let text = serde_json::to_string(&payload).unwrap_or_default();
    let _ = tx.send(Message::Text(text.into())).await;
}

async fn dispatch(state: &Arc<AppState>, identity: &Identity, inbound: InboundEvent) -> Result<(), CoordError> {
    match inbound {
        InboundEvent::StartSession { department, semester, section, expected_size, mode } => {
            let faculty = identity.faculty()?.clone();
            let triple = Triple::new(department, semester, section);
            let session = state.coordinator.start_session(triple.clone(), expected_size, mode, faculty.clone()).await?;
            publish_to(state, &faculty, &triple, "sessionStarted", serde_json::to_value(&session).unwrap_or_default()).await;
        }
        InboundEvent::LockSession { session_id } => {
            let faculty = identity.faculty()?;
            let session = state.coordinator.lock(session_id, faculty).await?;
            publish_to(state, faculty, &session.triple, "sessionLocked", status_update_payload(&session, "locked")).await;
        }
        InboundEvent::UnlockSession { session_id } => {
            let faculty = identity.faculty()?;
            let session = state.coordinator.unlock(session_id, faculty).await?;
            publish_to(state, faculty, &session.triple, "sessionUnlocked", status_update_payload(&session, "unlocked")).await;
        }
        InboundEvent::StartAttendance { session_id } => {
            let faculty = identity.faculty()?;
            let session = state.coordinator.start_attendance(session_id, faculty, &state.worker_id).await?;
            state.rotators.start_single(
                state.coordinator.clone(),
                state.rotator_sink(),
                session.id,
                state.worker_id.clone(),
                state.config.token_rotate_interval(),
            );
            publish_to(state, faculty, &session.triple, "attendanceStarted", status_update_payload(&session, "attendance started")).await;
        }
        InboundEvent::EndSession { session_id } => {
            let faculty = identity.faculty()?;
            let (session, record) = state.coordinator.end_session(session_id, faculty).await?;
            state.rotators.stop(session.id);
            publish_to(
                state,
                faculty,
                &session.triple,
                "sessionEnded",
                serde_json::json!({ "session": status_update_payload(&session, "ended"), "record": record }),
            )
            .await;
        }
        InboundEvent::BroadcastJoinAvailable { session_id } => {
            let faculty = identity.faculty()?;
            let session = state.coordinator.store.get(session_id).await?.ok_or(CoordError::NotFound)?;
            publish_to(state, faculty, &session.triple, "sessionStatusUpdate", status_update_payload(&session, "join available")).await;
        }
        InboundEvent::RequestTokenRefresh { session_id } => {
            identity.faculty()?;
            let session = state.coordinator.store.get(session_id).await?.ok_or(CoordError::NotFound)?;
            if session.status != crate::model::SessionStatus::Active {
                return Err(CoordError::PreconditionState);
            }
            state.rotators.start_single(
                state.coordinator.clone(),
                state.rotator_sink(),
                session_id,
                state.worker_id.clone(),
                state.config.token_rotate_interval(),
            );
        }
        InboundEvent::GroupStartSession { triples, mode } => {
            let faculty = identity.faculty()?.clone();
            let triples = triples.into_iter().map(|m| (Triple::new(m.department, m.semester, m.section), m.expected_size)).collect();
            let group = state.group.start_group(triples, mode, faculty.clone()).await?;
            let members: Vec<_> = group.members.iter().map(|m| serde_json::json!({ "sessionId": m.session_id, "triple": m.triple })).collect();
            publish_group(state, &faculty, &group.id, "sessionStarted", serde_json::json!({ "members": members })).await;
        }
        InboundEvent::GroupLockSession { group_id } => {
            let faculty = identity.faculty()?;
            let group = state.group.lock_group(group_id, faculty).await?;
            publish_group(state, faculty, &group.id, "sessionLocked", serde_json::json!({ "groupId": group.id, "status": group.status })).await;
        }
        InboundEvent::GroupUnlockSession { group_id } => {
            let faculty = identity.faculty()?;
            let group = state.group.unlock_group(group_id, faculty).await?;
            publish_group(state, faculty, &group.id, "sessionUnlocked", serde_json::json!({ "groupId": group.id, "status": group.status })).await;
        }
        InboundEvent::GroupStartAttendance { group_id } => {
            let faculty = identity.faculty()?;
            let group = state.group.start_attendance_group(group_id, faculty, &state.worker_id).await?;
            state.rotators.start_group(state.group.clone(), state.rotator_sink(), group.id, state.worker_id.clone(), state.config.token_rotate_interval());
            publish_group(state, faculty, &group.id, "attendanceStarted", serde_json::json!({ "groupId": group.id, "status": group.status })).await;
        }
        InboundEvent::GroupEndSession { group_id } => {
            let faculty = identity.faculty()?;
            let group = state.group.end_group(group_id, faculty).await?;
            state.rotators.stop(group.id);
            publish_group(state, faculty, &group.id, "sessionEnded", serde_json::json!({ "groupId": group.id, "status": group.status })).await;
        }
        InboundEvent::JoinSession { session_id, fingerprint } => {
            let student = identity.student()?;
            let outcome = state.coordinator.join(session_id, &student.student_id, &student.triple).await?;
            let _ = fingerprint; // bound at scan time, not at join time (spec §4.3).
            state.rooms.publish_local(
                &coordinator::faculty_room(&outcome.session.faculty.faculty_id),
                event("studentJoined", serde_json::json!({ "sessionId": session_id, "studentId": student.student_id, "alreadyJoined": outcome.already_joined })),
            );
        }
        InboundEvent::GetSessionStatus { session_id } => {
            let session = state.coordinator.store.get(session_id).await?.ok_or(CoordError::NotFound)?;
            let (joined, present) = state.coordinator.live_counts(&session).await;
            let mut body = status_flags(session.status);
            if let serde_json::Value::Object(ref mut map) = body {
                map.insert("joined".into(), joined.into());
                map.insert("present".into(), present.into());
            }
            state.rooms.publish_local(&coordinator::section_room(&session.triple), event("sessionStatusUpdate", body));
        }
    }
    Ok(())
}

async fn publish_to(state: &Arc<AppState>, faculty: &FacultyRef, triple: &Triple, name: &str, payload: serde_json::Value) {
    let ev = event(name, payload);
    let section = coordinator::section_room(triple);
    let faculty_key = coordinator::faculty_room(&faculty.faculty_id);
    state.rooms.publish_local(&section, ev.clone());
    state.rooms.publish_local(&faculty_key, ev.clone());
    if let Some(fabric) = &state.fabric {
        fabric.publish(&section, &ev).await;
        fabric.publish(&faculty_key, &ev).await;
    }
}

async fn publish_group(state: &Arc<AppState>, faculty: &FacultyRef, group_id: &Uuid, name: &str, mut payload: serde_json::Value) {
    if let serde_json::Value::Object(ref mut map) = payload {
        map.insert("groupId".into(), group_id.to_string().into());
    }
    let ev = event(name, payload);
    let faculty_key = coordinator::faculty_room(&faculty.faculty_id);
    state.rooms.publish_local(&faculty_key, ev.clone());
    if let Some(fabric) = &state.fabric {
        fabric.publish(&faculty_key, &ev).await;
    }
}
