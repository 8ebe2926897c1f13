// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core data model (spec §3): sessions, group sessions, and durable records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The (department, semester, section) triple identifying a classroom cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Triple {
    pub department: String,
    pub semester: String,
    pub section: String,
}

impl Triple {
    pub fn new(department: impl Into<String>, semester: impl Into<String>, section: impl Into<String>) -> Self {
        Self { department: department.into(), semester: semester.into(), section: section.into() }
    }

    /// `<dept>-<sem>-<sec>` — the section room / cache-key slug (§4.2, §4.7).
    pub fn slug(&self) -> String {
        format!("{}-{}-{}", self.department, self.semester, self.section)
    }
}

/// Attendance mode, controlling how absentees are reconciled at session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    RollBased,
    EmailBased,
}

/// Session lifecycle state (§4.5 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Created,
    Locked,
    Active,
    Ended,
}

impl SessionStatus {
    /// Whether `join` is currently accepted (mirrors the `canJoin` flag of §4.7).
    pub fn can_join(self) -> bool {
        matches!(self, Self::Created)
    }

    /// Whether `scan` is currently accepted (mirrors the `canScanQR` flag of §4.7).
    pub fn can_scan(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Owning faculty identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacultyRef {
    pub faculty_id: String,
    pub display_name: String,
    pub email: String,
}

/// Derived/cached counters (§3). Ground truth at session end is the cache
/// sets, reconciled into the durable record by [`crate::coordinator`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub joined: i64,
    pub present: i64,
    pub total_scans: i64,
    pub unique_devices: i64,
    pub duplicate_attempts: i64,
    pub invalid_token_attempts: i64,
}

/// The atomic scheduling unit (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub triple: Triple,
    pub faculty: FacultyRef,
    pub expected_size: i64,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub current_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub refresh_count: i64,
    pub counters: SessionCounters,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Version/CAS token bumped on every mutating write (§4.4 `transition`/`incr`).
    pub version: i64,
    /// Worker that currently owns the rotator lease for this session, if any (§4.9).
    pub rotator_owner: Option<String>,
    /// Member of an active group, if any (§4.6).
    pub group_id: Option<Uuid>,
}

impl Session {
    pub fn new(
        triple: Triple,
        faculty: FacultyRef,
        expected_size: i64,
        mode: SessionMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            triple,
            faculty,
            expected_size,
            mode,
            status: SessionStatus::Created,
            current_token: None,
            token_expiry: None,
            refresh_count: 0,
            counters: SessionCounters::default(),
            created_at: now,
            locked_at: None,
            started_at: None,
            ended_at: None,
            version: 1,
            rotator_owner: None,
            group_id: None,
        }
    }

    /// `session:<sid>:joined` / `session:<sid>:attended` (§4.2).
    pub fn joined_key(&self) -> String {
        format!("session:{}:joined", self.id)
    }

    pub fn attended_key(&self) -> String {
        format!("session:{}:attended", self.id)
    }
}

/// One member of a [`GroupSession`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub triple: Triple,
    pub session_id: Uuid,
    pub total_students: i64,
}

/// A faculty aggregate over N sibling sessions sharing one token stream (§3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSession {
    pub id: Uuid,
    pub faculty: FacultyRef,
    pub members: Vec<GroupMember>,
    pub status: SessionStatus,
    pub current_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub refresh_count: i64,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub rotator_owner: Option<String>,
}

impl GroupSession {
    pub fn new(faculty: FacultyRef, members: Vec<GroupMember>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            faculty,
            members,
            status: SessionStatus::Created,
            current_token: None,
            token_expiry: None,
            refresh_count: 0,
            created_at: now,
            locked_at: None,
            started_at: None,
            ended_at: None,
            version: 1,
            rotator_owner: None,
        }
    }

    pub fn resolve_member(&self, triple: &Triple) -> Option<&GroupMember> {
        self.members.iter().find(|m| &m.triple == triple)
    }
}

/// Produced at session end (§3): roster-cardinality, present/absent lists, identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub group_id: Option<Uuid>,
    pub triple: Triple,
    pub total_students: i64,
    pub present: Vec<String>,
    pub absent: Vec<String>,
    pub photos: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Kind carried by a signed token envelope (§3, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Single,
    Group,
}

/// Roll-based reconciliation: absentees are the complement of the attendance
/// set over `{"01", .., fmt(N)}` (spec §8 "Reconciliation").
pub fn roll_numbers(total: i64) -> Vec<String> {
    (1..=total.max(0)).map(|n| format!("{n:02}")).collect()
}
