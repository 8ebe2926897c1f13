// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Realtime Bus room registry (spec §4.7, component C7): per-room broadcast
//! channels, fanned across workers over the shared message fabric.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{SessionStatus, Triple};

/// `faculty:<facultyId>` or `section:<dept>-<sem>-<sec>` (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Faculty(String),
    Section(Triple),
}

impl RoomKey {
    pub fn subject(&self) -> String {
        match self {
            Self::Faculty(id) => format!("faculty.{id}"),
            Self::Section(triple) => format!("section.{}", triple.slug()),
        }
    }
}

/// Event payload broadcast to room subscribers. Named outbound events from
/// spec §6: `sessionStarted`, `sessionLocked`, `sessionUnlocked`,
/// `attendanceStarted`, `sessionEnded`, `sessionStatusUpdate`,
/// `tokenRefreshed`, `studentJoined`, `attendanceUpdate`, `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

impl RoomEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { event: event.into(), payload }
    }
}

/// Derived booleans clients need to avoid keeping their own state machine
/// (spec §4.7 "every published payload includes ... canJoin / canScanQR").
pub fn status_flags(status: SessionStatus) -> serde_json::Value {
    serde_json::json!({
        "status": status,
        "canJoin": status.can_join(),
        "canScanQR": status.can_scan(),
    })
}

const ROOM_CAPACITY: usize = 256;

/// Per-process registry of room broadcast channels. A room is created lazily
/// on first subscribe/publish and is never explicitly torn down: an idle
/// `broadcast::Sender` with no receivers is cheap, and rooms are re-derived
/// from stable keys (section/faculty identity), not per-connection state.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, broadcast::Sender<RoomEvent>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, key: &RoomKey) -> broadcast::Sender<RoomEvent> {
        self.rooms
            .entry(key.subject())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, key: &RoomKey) -> broadcast::Receiver<RoomEvent> {
        self.sender_for(key).subscribe()
    }

    /// Publishes locally only. Cross-worker delivery is the caller's
    /// responsibility via [`crate::transport::fabric`] (spec §4.7 sticky
    /// routing).
    pub fn publish_local(&self, key: &RoomKey, event: RoomEvent) {
        // A room with no local subscribers yields a `SendError`, which is
        // expected and not a failure of the publish.
        let _ = self.sender_for(key).send(event);
    }
}

/// Rooms a connecting faculty member joins: their own room plus every
/// section room named in `sections` (spec §4.7 "a faculty joins their room
/// plus each of their section rooms").
pub fn faculty_rooms(faculty_id: &str, sections: &[Triple]) -> Vec<RoomKey> {
    let mut rooms = vec![RoomKey::Faculty(faculty_id.to_owned())];
    rooms.extend(sections.iter().cloned().map(RoomKey::Section));
    rooms
}
