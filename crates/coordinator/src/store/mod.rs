// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Store (spec §4.4, component C4): durable, authoritative record of
//! sessions, group sessions, counters, and timestamps.

mod postgres;

pub use postgres::PgSessionStore;
#[cfg(any(test, feature = "test-support"))]
pub use postgres::memory::InMemorySessionStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoordError;
use crate::model::{AttendanceRecord, FacultyRef, GroupSession, Session, SessionMode, SessionStatus, Triple};

/// Fields an `incr` call may bump (spec §4.4 `incr`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrFields {
    pub joined: i64,
    pub present: i64,
    pub scans: i64,
    pub duplicate_attempts: i64,
    pub invalid_token_attempts: i64,
}

/// Durable record of sessions, group sessions, and attendance records.
/// Every mutating operation is either CAS-linearized on `version` or an
/// atomic counter bump; see spec §4.4 and §5.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, CoordError>;

    async fn get(&self, sid: Uuid) -> Result<Option<Session>, CoordError>;

    async fn find_active_for_triple(&self, triple: &Triple) -> Result<Option<Session>, CoordError>;

    /// Compare-and-set on `(status, version)`; `mutate` computes the new
    /// session in-place given the fetched current value, then the call
    /// atomically commits iff the observed version still matches.
    async fn transition(
        &self,
        sid: Uuid,
        expected_version: i64,
        next_status: SessionStatus,
        mutate: Box<dyn FnOnce(&mut Session) + Send>,
    ) -> Result<Session, CoordError>;

    async fn incr(&self, sid: Uuid, fields: IncrFields) -> Result<Session, CoordError>;

    async fn reap(&self, older_than_days: i64) -> Result<u64, CoordError>;

    async fn save_attendance_record(&self, record: AttendanceRecord) -> Result<(), CoordError>;

    async fn create_group(&self, group: GroupSession) -> Result<GroupSession, CoordError>;

    async fn get_group(&self, gid: Uuid) -> Result<Option<GroupSession>, CoordError>;

    async fn transition_group(
        &self,
        gid: Uuid,
        expected_version: i64,
        next_status: SessionStatus,
        mutate: Box<dyn FnOnce(&mut GroupSession) + Send>,
    ) -> Result<GroupSession, CoordError>;

    /// Sessions whose rotator lease is stale beyond the configured threshold
    /// (spec §4.9 maintenance loop "reaps orphaned rotators").
    async fn find_stale_rotators(&self, stale_secs: i64) -> Result<Vec<Session>, CoordError>;

    async fn claim_rotator_owner(
        &self,
        sid: Uuid,
        expected_version: i64,
        worker_id: &str,
    ) -> Result<Session, CoordError>;
}

/// Convenience constructor bundling a faculty-owned `startSession` (spec
/// §4.5): ends any live sibling for the triple, then creates the new record.
pub async fn start_session(
    store: &dyn SessionStore,
    triple: Triple,
    faculty: FacultyRef,
    expected_size: i64,
    mode: SessionMode,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Session, CoordError> {
    if let Some(sibling) = store.find_active_for_triple(&triple).await? {
        if sibling.status != SessionStatus::Ended {
            store
                .transition(
                    sibling.id,
                    sibling.version,
                    SessionStatus::Ended,
                    Box::new(move |s| s.ended_at = Some(now)),
                )
                .await?;
        }
    }

    let session = Session::new(triple, faculty, expected_size, mode, now);
    store.create(session).await
}

/// Spawns the master-only retention sweep that reaps ENDED sessions past
/// `retention_days` (spec §4.4 `reap`), on the same interval-loop shape as
/// `rotator::spawn_orphan_reaper`.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    retention_days: i64,
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

            match store.reap(retention_days).await {
                Ok(0) => {}
                Ok(n) => info!(reaped = n, retention_days, "reaped ended sessions past retention"),
                Err(e) => warn!(err = ?e, "session reap sweep failed"),
            }
        }
    });
}
