// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token Rotator (spec §4.9, component C9): a single-owner refresh loop per
//! active session or group. Structured like a credential refresh loop — one
//! spawned task per subject, cancelled via a per-subject token and torn down
//! with the rest of the process on shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{self, Coordinator};
use crate::model::{SessionStatus, TokenKind};
use crate::room::RoomEvent;
use crate::store::SessionStore;
use crate::transport::fabric::Fabric;

/// Emits a freshly-minted token to the owning faculty room, locally and over
/// the cross-worker fabric (spec §4.7 "the token rotator publishes only to
/// the faculty room").
#[derive(Clone)]
pub struct RotatorSink {
    pub rooms: crate::room::RoomRegistry,
    pub fabric: Option<Fabric>,
}

impl RotatorSink {
    pub async fn emit(&self, faculty_id: &str, event: RoomEvent) {
        let key = coordinator::faculty_room(faculty_id);
        self.rooms.publish_local(&key, event.clone());
        if let Some(fabric) = &self.fabric {
            fabric.publish(&key, &event).await;
        }
    }
}

/// Single-owner timer per session, keyed by session id. Holds the
/// [`CancellationToken`] needed to implement `stop(sid)` idempotently.
#[derive(Default)]
pub struct RotatorTable {
    handles: DashMap<Uuid, CancellationToken>,
}

impl RotatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a rotator for `sid` if one isn't already running locally.
    /// Ownership across workers is established by the Store CAS in
    /// `startAttendance`/`claim_rotator_owner`; this only prevents a second
    /// local task for the same id.
    pub fn start_single(
        self: &Arc<Self>,
        coord: Coordinator,
        sink: RotatorSink,
        sid: Uuid,
        worker_id: String,
        period: Duration,
    ) {
        if self.handles.contains_key(&sid) {
            return;
        }
        let cancel = CancellationToken::new();
        self.handles.insert(sid, cancel.clone());
        let table = Arc::clone(self);

        tokio::spawn(async move {
            refresh_loop_single(coord, sink, sid, worker_id, period, cancel).await;
            table.handles.remove(&sid);
        });
    }

    pub fn start_group(
        self: &Arc<Self>,
        group: crate::group::GroupCoordinator,
        sink: RotatorSink,
        gid: Uuid,
        worker_id: String,
        period: Duration,
    ) {
        if self.handles.contains_key(&gid) {
            return;
        }
        let cancel = CancellationToken::new();
        self.handles.insert(gid, cancel.clone());
        let table = Arc::clone(self);

        tokio::spawn(async move {
            refresh_loop_group(group, sink, gid, worker_id, period, cancel).await;
            table.handles.remove(&gid);
        });
    }

    /// `stop(sid)`: cancels the timer; idempotent.
    pub fn stop(&self, sid: Uuid) {
        if let Some((_, cancel)) = self.handles.remove(&sid) {
            cancel.cancel();
        }
    }
}

async fn refresh_loop_single(
    coord: Coordinator,
    sink: RotatorSink,
    sid: Uuid,
    worker_id: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let Ok(Some(session)) = coord.store.get(sid).await else { break };
        if session.status != SessionStatus::Active {
            break;
        }

        let (token, expiry) = coord.tokens.mint(sid, TokenKind::Single);
        let refresh_count = session.refresh_count + 1;
        let result = coord
            .store
            .transition(
                sid,
                session.version,
                SessionStatus::Active,
                Box::new({
                    let token = token.clone();
                    move |s| {
                        s.current_token = Some(token);
                        s.token_expiry = Some(expiry);
                        s.refresh_count = refresh_count;
                    }
                }),
            )
            .await;

        match result {
            Ok(_) => {
                sink.emit(
                    &session.faculty.faculty_id,
                    RoomEvent::new(
                        "tokenRefreshed",
                        serde_json::json!({
                            "sessionId": sid,
                            "token": token,
                            "expiry": expiry,
                            "refreshCount": refresh_count,
                            "timerSeconds": period.as_secs(),
                        }),
                    ),
                )
                .await;
            }
            Err(e) => {
                warn!(sid = %sid, worker = worker_id, err = %e, "rotator lost CAS race, stopping");
                break;
            }
        }
    }
    info!(sid = %sid, "rotator stopped");
}

async fn refresh_loop_group(
    group_coord: crate::group::GroupCoordinator,
    sink: RotatorSink,
    gid: Uuid,
    worker_id: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let Ok(Some(group)) = group_coord.single.store.get_group(gid).await else { break };
        if group.status != SessionStatus::Active {
            break;
        }

        let (token, expiry) = group_coord.tokens.mint(gid, TokenKind::Group);
        let refresh_count = group.refresh_count + 1;
        let result = group_coord
            .single
            .store
            .transition_group(
                gid,
                group.version,
                SessionStatus::Active,
                Box::new({
                    let token = token.clone();
                    move |g| {
                        g.current_token = Some(token);
                        g.token_expiry = Some(expiry);
                        g.refresh_count = refresh_count;
                    }
                }),
            )
            .await;

        match result {
            Ok(updated) => {
                group_coord.mirror_token_to_members(&updated).await.ok();
                sink.emit(
                    &updated.faculty.faculty_id,
                    RoomEvent::new(
                        "tokenRefreshed",
                        serde_json::json!({
                            "groupId": gid,
                            "token": token,
                            "expiry": expiry,
                            "refreshCount": refresh_count,
                            "timerSeconds": period.as_secs(),
                        }),
                    ),
                )
                .await;
            }
            Err(e) => {
                warn!(gid = %gid, worker = worker_id, err = %e, "group rotator lost CAS race, stopping");
                break;
            }
        }
    }
    info!(gid = %gid, "group rotator stopped");
}

/// Master-only maintenance loop (spec §4.9, §5): re-elects an owner for any
/// ACTIVE session whose token has gone stale, implying its previous owner
/// crashed.
pub fn spawn_orphan_reaper(
    coord: Coordinator,
    table: Arc<RotatorTable>,
    sink: RotatorSink,
    worker_id: String,
    stale: Duration,
    period: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let Ok(stale_sessions) = coord.store.find_stale_rotators(stale.as_secs() as i64).await else { continue };
            for session in stale_sessions {
                match coord.store.claim_rotator_owner(session.id, session.version, &worker_id).await {
                    Ok(_) => {
                        warn!(sid = %session.id, "reaped orphaned rotator, re-electing ownership");
                        table.start_single(coord.clone(), sink.clone(), session.id, worker_id.clone(), Duration::from_secs(5));
                    }
                    Err(_) => continue, // lost the CAS race to another worker; fine.
                }
            }
        }
    });
}
