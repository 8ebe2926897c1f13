// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Coordinator (spec §4.5, component C5): the state machine,
//! membership operations, attendance marking, and end-of-session
//! reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cache::{Outcome, SharedCache};
use crate::devicebinding::DeviceBindingCache;
use crate::error::CoordError;
use crate::model::{
    AttendanceRecord, FacultyRef, Session, SessionMode, SessionStatus, TokenKind, Triple,
};
use crate::room::{status_flags, RoomEvent, RoomKey};
use crate::store::{self, IncrFields, SessionStore};
use crate::token::TokenMint;

/// Shared dependencies every mutating operation needs. Constructed once per
/// process and cloned (cheaply — every field is already `Arc`-backed) into
/// request handlers.
#[derive(Clone)]
pub struct Coordinator {
    pub store: Arc<dyn SessionStore>,
    pub cache: Arc<SharedCache>,
    pub bindings: Arc<DeviceBindingCache>,
    pub tokens: Arc<TokenMint>,
    pub membership_ttl: Duration,
}

/// Result of a `join` call, carrying the idempotency flag clients need
/// (spec §4.5 `join` row).
pub struct JoinOutcome {
    pub session: Session,
    pub already_joined: bool,
}

/// Result of a `scan` call.
pub struct ScanOutcome {
    pub session: Session,
    pub already_marked: bool,
}

impl Coordinator {
    fn authorize_faculty(session: &Session, caller: &FacultyRef) -> Result<(), CoordError> {
        if session.faculty.faculty_id == caller.faculty_id {
            Ok(())
        } else {
            Err(CoordError::AuthZ)
        }
    }

    /// `startSession(triple, size, type, faculty) -> CREATED` (spec §4.5).
    pub async fn start_session(
        &self,
        triple: Triple,
        expected_size: i64,
        mode: SessionMode,
        faculty: FacultyRef,
    ) -> Result<Session, CoordError> {
        let now = Utc::now();
        let session = store::start_session(&*self.store, triple.clone(), faculty, expected_size, mode, now).await?;
        self.bindings.preload(&self.cache, &triple).await.map_err(|_| CoordError::Transient)?;
        Ok(session)
    }

    /// `join(student) -> CREATED` (spec §4.5).
    pub async fn join(&self, sid: Uuid, student_id: &str, triple: &Triple) -> Result<JoinOutcome, CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        if &session.triple != triple {
            return Err(CoordError::Validation);
        }
        if !session.status.can_join() {
            return Err(CoordError::PreconditionState);
        }

        let added = match self.cache.set_add(&session.joined_key(), student_id, self.membership_ttl).await {
            Outcome::Hit(added) => added,
            Outcome::Miss | Outcome::Degraded => true,
        };

        if added {
            let session = self.store.incr(sid, IncrFields { joined: 1, ..Default::default() }).await?;
            Ok(JoinOutcome { session, already_joined: false })
        } else {
            Ok(JoinOutcome { session, already_joined: true })
        }
    }

    /// `lock(faculty) -> LOCKED` (spec §4.5).
    pub async fn lock(&self, sid: Uuid, caller: &FacultyRef) -> Result<Session, CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize_faculty(&session, caller)?;
        if session.status != SessionStatus::Created {
            return Err(CoordError::PreconditionState);
        }
        let now = Utc::now();
        self.store
            .transition(sid, session.version, SessionStatus::Locked, Box::new(move |s| s.locked_at = Some(now)))
            .await
    }

    /// `unlock(faculty) -> CREATED` (spec §4.5).
    pub async fn unlock(&self, sid: Uuid, caller: &FacultyRef) -> Result<Session, CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize_faculty(&session, caller)?;
        if session.status != SessionStatus::Locked {
            return Err(CoordError::PreconditionState);
        }
        self.store
            .transition(sid, session.version, SessionStatus::Created, Box::new(|s| s.locked_at = None))
            .await
    }

    /// `startAttendance(faculty) -> ACTIVE` (spec §4.5). Mints the first
    /// token; the rotator (C9) takes over subsequent refreshes.
    pub async fn start_attendance(
        &self,
        sid: Uuid,
        caller: &FacultyRef,
        worker_id: &str,
    ) -> Result<Session, CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize_faculty(&session, caller)?;
        if session.status != SessionStatus::Locked {
            return Err(CoordError::PreconditionState);
        }

        let (token, expiry) = self.tokens.mint(sid, TokenKind::Single);
        let now = Utc::now();
        let worker_id = worker_id.to_owned();
        self.store
            .transition(
                sid,
                session.version,
                SessionStatus::Active,
                Box::new(move |s| {
                    s.started_at = Some(now);
                    s.current_token = Some(token);
                    s.token_expiry = Some(expiry);
                    s.refresh_count = 1;
                    s.rotator_owner = Some(worker_id);
                }),
            )
            .await
    }

    /// `scan(token, student) -> ACTIVE` (spec §4.5).
    pub async fn scan(
        &self,
        sid: Uuid,
        student_id: &str,
        roll_number: &str,
        triple: &Triple,
        token: &str,
        fingerprint: Option<&str>,
    ) -> Result<ScanOutcome, CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        if &session.triple != triple {
            return Err(CoordError::Validation);
        }
        if !session.status.can_scan() {
            return Err(CoordError::PreconditionState);
        }

        // A member of a group scans the group's token, mirrored into this
        // session's `current_token` by `GroupCoordinator::mirror_token_to_members`
        // (spec §4.6); the member session was already resolved by the
        // scanning student's triple, not by anything embedded in the token
        // (spec §4.6, Open Question 3) — the token's own `sid` is the group
        // id and is never consulted here.
        let expected_kind = if session.group_id.is_some() { TokenKind::Group } else { TokenKind::Single };
        let verify_result = self.tokens.verify_kind(token, expected_kind);
        if verify_result.is_err() {
            self.store
                .incr(sid, IncrFields { invalid_token_attempts: 1, ..Default::default() })
                .await
                .ok();
            verify_result.map_err(CoordError::from)?;
        }

        let in_join_set = match self.cache.set_ismember(&session.joined_key(), student_id).await {
            Outcome::Hit(v) => v,
            Outcome::Degraded => true, // degrade to authoritative below
            Outcome::Miss => false,
        };
        if !in_join_set {
            return Err(CoordError::NotJoined);
        }

        if let Some(bound) = self.bindings.fingerprint_for(&self.cache, triple, student_id).await.map_err(|_| CoordError::Transient)? {
            if fingerprint.map(|f| f != bound).unwrap_or(true) {
                self.store
                    .incr(sid, IncrFields { duplicate_attempts: 1, ..Default::default() })
                    .await
                    .ok();
                return Err(CoordError::SuspectedProxy);
            }
        }

        let already = match self.cache.set_ismember(&session.attended_key(), roll_number).await {
            Outcome::Hit(v) => v,
            Outcome::Miss | Outcome::Degraded => false,
        };
        if already {
            return Err(CoordError::AlreadyMarked);
        }

        let added = match self.cache.set_add(&session.attended_key(), roll_number, self.membership_ttl).await {
            Outcome::Hit(added) => added,
            Outcome::Miss | Outcome::Degraded => true,
        };

        if added {
            let session = self
                .store
                .incr(sid, IncrFields { present: 1, scans: 1, ..Default::default() })
                .await?;
            Ok(ScanOutcome { session, already_marked: false })
        } else {
            Ok(ScanOutcome { session, already_marked: true })
        }
    }

    /// `endSession(faculty) -> ENDED` (spec §4.5). Reconciles the attendance
    /// set into a durable record and clears the per-session cache keys.
    pub async fn end_session(&self, sid: Uuid, caller: &FacultyRef) -> Result<(Session, AttendanceRecord), CoordError> {
        let session = self.store.get(sid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize_faculty(&session, caller)?;
        if session.status == SessionStatus::Ended {
            return Err(CoordError::PreconditionState);
        }

        self.tokens.invalidate_by_session(sid);

        let present = match self.cache.set_members(&session.attended_key()).await {
            Outcome::Hit(v) => v,
            Outcome::Miss | Outcome::Degraded => Vec::new(),
        };
        let absent = match session.mode {
            SessionMode::RollBased => {
                let all = crate::model::roll_numbers(session.expected_size);
                all.into_iter().filter(|roll| !present.contains(roll)).collect()
            }
            SessionMode::EmailBased => Vec::new(),
        };

        let now = Utc::now();
        let ended = self
            .store
            .transition(
                sid,
                session.version,
                SessionStatus::Ended,
                Box::new(move |s| {
                    s.ended_at = Some(now);
                    s.current_token = None;
                    s.token_expiry = None;
                    s.rotator_owner = None;
                }),
            )
            .await?;

        let record = AttendanceRecord {
            id: Uuid::new_v4(),
            session_id: sid,
            group_id: session.group_id,
            triple: session.triple.clone(),
            total_students: session.expected_size,
            present,
            absent,
            photos: Vec::new(),
            created_at: now,
        };
        self.store.save_attendance_record(record.clone()).await?;

        self.cache.del(&session.joined_key()).await;
        self.cache.del(&session.attended_key()).await;

        Ok((ended, record))
    }

    /// Live counters for status/stats endpoints: cache cardinalities when
    /// healthy, falling back to the durable counters otherwise (spec §4.5
    /// "Counter values returned to clients are live reads ... when the cache
    /// is healthy").
    pub async fn live_counts(&self, session: &Session) -> (i64, i64) {
        let joined = match self.cache.set_card(&session.joined_key()).await {
            Outcome::Hit(n) => n,
            Outcome::Miss | Outcome::Degraded => session.counters.joined,
        };
        let present = match self.cache.set_card(&session.attended_key()).await {
            Outcome::Hit(n) => n,
            Outcome::Miss | Outcome::Degraded => session.counters.present,
        };
        (joined, present)
    }
}

/// Builds the `sessionStatusUpdate` payload shape from spec §6: status +
/// canJoin + canScanQR + facultyName + triple + message.
pub fn status_update_payload(session: &Session, message: &str) -> serde_json::Value {
    let mut flags = status_flags(session.status);
    if let serde_json::Value::Object(ref mut map) = flags {
        map.insert("facultyName".into(), session.faculty.display_name.clone().into());
        map.insert("triple".into(), serde_json::to_value(&session.triple).unwrap_or_default());
        map.insert("message".into(), message.into());
        map.insert("sessionId".into(), session.id.to_string().into());
    }
    flags
}

pub fn section_room(triple: &Triple) -> RoomKey {
    RoomKey::Section(triple.clone())
}

pub fn faculty_room(faculty_id: &str) -> RoomKey {
    RoomKey::Faculty(faculty_id.to_owned())
}

pub fn event(name: &str, payload: serde_json::Value) -> RoomEvent {
    RoomEvent::new(name, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;

    fn faculty() -> FacultyRef {
        FacultyRef { faculty_id: "f1".into(), display_name: "Dr. Lin".into(), email: "lin@example.edu".into() }
    }

    fn triple() -> Triple {
        Triple::new("CS", "2026A", "01")
    }

    fn harness() -> Coordinator {
        Coordinator {
            store: Arc::new(InMemorySessionStore::default()),
            // Degraded cache: every path below exercises the fallback to
            // the Store, per spec §4.2's fallback discipline.
            cache: Arc::new(SharedCache::disabled()),
            bindings: Arc::new(DeviceBindingCache::new(Arc::new(NoopIdentitySource), Duration::from_secs(300))),
            tokens: Arc::new(TokenMint::new("test-secret", Duration::from_secs(7))),
            membership_ttl: Duration::from_secs(7200),
        }
    }

    /// Same harness, but with a live (process-local) Shared Cache instead of
    /// a degraded one, for tests that exercise the real membership/dedup
    /// semantics rather than the fallback path.
    fn harness_with_live_cache() -> Coordinator {
        Coordinator { cache: Arc::new(SharedCache::in_memory()), ..harness() }
    }

    struct NoopIdentitySource;

    #[async_trait::async_trait]
    impl crate::devicebinding::IdentitySource for NoopIdentitySource {
        async fn section_fingerprints(&self, _triple: &Triple) -> anyhow::Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn start_session_ends_non_ended_sibling() {
        let coord = harness();
        let first = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();
        let second = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();

        let reloaded_first = coord.store.get(first.id).await.unwrap().unwrap();
        assert_eq!(reloaded_first.status, SessionStatus::Ended);
        assert_eq!(second.status, SessionStatus::Created);
    }

    /// With a live Shared Cache, a repeat `join` from the same student is a
    /// no-op (§4.5 idempotency). With the cache degraded there is no
    /// surviving record of who already joined, so the fallback favors
    /// availability: the call still succeeds rather than blocking, at the
    /// cost of a counter that can over-count until the cache recovers
    /// (§4.2 fallback discipline).
    #[tokio::test]
    async fn duplicate_join_under_a_degraded_cache_still_succeeds() {
        let coord = harness();
        let session = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();

        let first = coord.join(session.id, "s1", &session.triple).await.unwrap();
        assert!(!first.already_joined);
        let second = coord.join(session.id, "s1", &session.triple).await.unwrap();
        assert!(!second.already_joined);
        assert_eq!(second.session.counters.joined, 2);
    }

    #[tokio::test]
    async fn duplicate_join_with_a_live_cache_is_idempotent() {
        let coord = harness_with_live_cache();
        let session = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();

        let first = coord.join(session.id, "s1", &session.triple).await.unwrap();
        assert!(!first.already_joined);
        let second = coord.join(session.id, "s1", &session.triple).await.unwrap();
        assert!(second.already_joined);
        assert_eq!(second.session.counters.joined, 1);
    }

    #[tokio::test]
    async fn duplicate_scan_with_a_live_cache_is_rejected() {
        let coord = harness_with_live_cache();
        let session = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();
        coord.join(session.id, "s1", &session.triple).await.unwrap();
        let session = coord.lock(session.id, &faculty()).await.unwrap();
        let session = coord.start_attendance(session.id, &faculty(), "worker-1").await.unwrap();
        let token = session.current_token.clone().unwrap();

        let first = coord.scan(session.id, "s1", "01", &session.triple, &token, None).await.unwrap();
        assert!(!first.already_marked);
        let err = coord.scan(session.id, "s1", "01", &session.triple, &token, None).await.unwrap_err();
        assert_eq!(err, CoordError::AlreadyMarked);
    }

    #[tokio::test]
    async fn lock_requires_matching_faculty() {
        let coord = harness();
        let session = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();
        let other = FacultyRef { faculty_id: "someone-else".into(), display_name: "X".into(), email: "x@y.z".into() };

        let err = coord.lock(session.id, &other).await.unwrap_err();
        assert_eq!(err, CoordError::AuthZ);
    }

    /// A token minted while ACTIVE must not mark attendance once the session
    /// has ended, even though the token's own signature/expiry window would
    /// otherwise still be live (spec §4.1 "a token exists only while status
    /// = ACTIVE").
    #[tokio::test]
    async fn scan_after_end_is_rejected_even_with_a_still_fresh_token() {
        let coord = harness_with_live_cache();
        let session = coord.start_session(triple(), 30, SessionMode::RollBased, faculty()).await.unwrap();
        coord.join(session.id, "s1", &session.triple).await.unwrap();
        let session = coord.lock(session.id, &faculty()).await.unwrap();
        let session = coord.start_attendance(session.id, &faculty(), "worker-1").await.unwrap();
        let token = session.current_token.clone().unwrap();

        coord.end_session(session.id, &faculty()).await.unwrap();

        let err = coord.scan(session.id, "s1", "01", &session.triple, &token, None).await.unwrap_err();
        assert_eq!(err, CoordError::PreconditionState);
    }
}
