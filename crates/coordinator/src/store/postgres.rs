// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{IncrFields, SessionStore};
use crate::error::CoordError;
use crate::model::{
    AttendanceRecord, FacultyRef, GroupMember, GroupSession, Session, SessionCounters, SessionMode,
    SessionStatus, Triple,
};

/// Postgres-backed [`SessionStore`]. A `DashMap` hot cache mirrors recently
/// touched sessions in-process, the way `SessionCache` layers a `DashMap`
/// over a `PgPool` — reads prefer the hot entry, every write goes through
/// Postgres first and only then updates the mirror.
pub struct PgSessionStore {
    pool: PgPool,
    hot: DashMap<Uuid, Session>,
}

impl PgSessionStore {
    pub async fn connect(db_uri: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(db_uri).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, hot: DashMap::new() })
    }

    fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session, CoordError> {
        let status_str: String = row.try_get("status").map_err(|_| CoordError::Internal)?;
        let mode_str: String = row.try_get("mode").map_err(|_| CoordError::Internal)?;
        Ok(Session {
            id: row.try_get("id").map_err(|_| CoordError::Internal)?,
            triple: Triple::new(
                row.try_get::<String, _>("department").map_err(|_| CoordError::Internal)?,
                row.try_get::<String, _>("semester").map_err(|_| CoordError::Internal)?,
                row.try_get::<String, _>("section").map_err(|_| CoordError::Internal)?,
            ),
            faculty: FacultyRef {
                faculty_id: row.try_get("faculty_id").map_err(|_| CoordError::Internal)?,
                display_name: row.try_get("faculty_name").map_err(|_| CoordError::Internal)?,
                email: row.try_get("faculty_email").map_err(|_| CoordError::Internal)?,
            },
            expected_size: row.try_get("expected_size").map_err(|_| CoordError::Internal)?,
            mode: parse_mode(&mode_str),
            status: parse_status(&status_str)?,
            current_token: row.try_get("current_token").map_err(|_| CoordError::Internal)?,
            token_expiry: row.try_get("token_expiry").map_err(|_| CoordError::Internal)?,
            refresh_count: row.try_get("refresh_count").map_err(|_| CoordError::Internal)?,
            counters: SessionCounters {
                joined: row.try_get("joined").map_err(|_| CoordError::Internal)?,
                present: row.try_get("present").map_err(|_| CoordError::Internal)?,
                total_scans: row.try_get("total_scans").map_err(|_| CoordError::Internal)?,
                unique_devices: row.try_get("unique_devices").map_err(|_| CoordError::Internal)?,
                duplicate_attempts: row.try_get("duplicate_attempts").map_err(|_| CoordError::Internal)?,
                invalid_token_attempts: row
                    .try_get("invalid_token_attempts")
                    .map_err(|_| CoordError::Internal)?,
            },
            created_at: row.try_get("created_at").map_err(|_| CoordError::Internal)?,
            locked_at: row.try_get("locked_at").map_err(|_| CoordError::Internal)?,
            started_at: row.try_get("started_at").map_err(|_| CoordError::Internal)?,
            ended_at: row.try_get("ended_at").map_err(|_| CoordError::Internal)?,
            version: row.try_get("version").map_err(|_| CoordError::Internal)?,
            rotator_owner: row.try_get("rotator_owner").map_err(|_| CoordError::Internal)?,
            group_id: row.try_get("group_id").map_err(|_| CoordError::Internal)?,
        })
    }

    async fn upsert_full(&self, s: &Session, expected_version: Option<i64>) -> Result<u64, CoordError> {
        let result = match expected_version {
            Some(expected) => sqlx::query(
                r#"
                UPDATE sessions SET
                    status = $1, current_token = $2, token_expiry = $3, refresh_count = $4,
                    joined = $5, present = $6, total_scans = $7, unique_devices = $8,
                    duplicate_attempts = $9, invalid_token_attempts = $10,
                    locked_at = $11, started_at = $12, ended_at = $13,
                    version = version + 1, rotator_owner = $14, group_id = $15
                WHERE id = $16 AND version = $17
                "#,
            )
            .bind(status_str(s.status))
            .bind(&s.current_token)
            .bind(s.token_expiry)
            .bind(s.refresh_count)
            .bind(s.counters.joined)
            .bind(s.counters.present)
            .bind(s.counters.total_scans)
            .bind(s.counters.unique_devices)
            .bind(s.counters.duplicate_attempts)
            .bind(s.counters.invalid_token_attempts)
            .bind(s.locked_at)
            .bind(s.started_at)
            .bind(s.ended_at)
            .bind(&s.rotator_owner)
            .bind(s.group_id)
            .bind(s.id)
            .bind(expected)
            .execute(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                INSERT INTO sessions (
                    id, department, semester, section, faculty_id, faculty_name, faculty_email,
                    expected_size, mode, status, current_token, token_expiry, refresh_count,
                    joined, present, total_scans, unique_devices, duplicate_attempts,
                    invalid_token_attempts, created_at, locked_at, started_at, ended_at,
                    version, rotator_owner, group_id
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
                )
                "#,
            )
            .bind(s.id)
            .bind(&s.triple.department)
            .bind(&s.triple.semester)
            .bind(&s.triple.section)
            .bind(&s.faculty.faculty_id)
            .bind(&s.faculty.display_name)
            .bind(&s.faculty.email)
            .bind(s.expected_size)
            .bind(mode_str(s.mode))
            .bind(status_str(s.status))
            .bind(&s.current_token)
            .bind(s.token_expiry)
            .bind(s.refresh_count)
            .bind(s.counters.joined)
            .bind(s.counters.present)
            .bind(s.counters.total_scans)
            .bind(s.counters.unique_devices)
            .bind(s.counters.duplicate_attempts)
            .bind(s.counters.invalid_token_attempts)
            .bind(s.created_at)
            .bind(s.locked_at)
            .bind(s.started_at)
            .bind(s.ended_at)
            .bind(s.version)
            .bind(&s.rotator_owner)
            .bind(s.group_id)
            .execute(&self.pool)
            .await,
        };

        result.map(|r| r.rows_affected()).map_err(|e| {
            tracing::warn!(err = %e, "session store write failed");
            CoordError::Transient
        })
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Created => "CREATED",
        SessionStatus::Locked => "LOCKED",
        SessionStatus::Active => "ACTIVE",
        SessionStatus::Ended => "ENDED",
    }
}

fn parse_status(s: &str) -> Result<SessionStatus, CoordError> {
    match s {
        "CREATED" => Ok(SessionStatus::Created),
        "LOCKED" => Ok(SessionStatus::Locked),
        "ACTIVE" => Ok(SessionStatus::Active),
        "ENDED" => Ok(SessionStatus::Ended),
        _ => Err(CoordError::Internal),
    }
}

fn mode_str(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::RollBased => "roll_based",
        SessionMode::EmailBased => "email_based",
    }
}

fn parse_mode(s: &str) -> SessionMode {
    match s {
        "email_based" => SessionMode::EmailBased,
        _ => SessionMode::RollBased,
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: Session) -> Result<Session, CoordError> {
        if let Some(existing) = self.find_active_for_triple(&session.triple).await? {
            if existing.status != SessionStatus::Ended {
                return Err(CoordError::Conflict);
            }
        }
        self.upsert_full(&session, None).await?;
        self.hot.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get(&self, sid: Uuid) -> Result<Option<Session>, CoordError> {
        if let Some(hit) = self.hot.get(&sid) {
            return Ok(Some(hit.clone()));
        }
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(sid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoordError::Transient)?;
        match row {
            Some(row) => {
                let session = Self::row_to_session(&row)?;
                self.hot.insert(sid, session.clone());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn find_active_for_triple(&self, triple: &Triple) -> Result<Option<Session>, CoordError> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE department = $1 AND semester = $2 AND section = $3 \
             AND status != 'ENDED' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(&triple.department)
        .bind(&triple.semester)
        .bind(&triple.section)
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;
        row.map(|r| Self::row_to_session(&r)).transpose()
    }

    async fn transition(
        &self,
        sid: Uuid,
        expected_version: i64,
        next_status: SessionStatus,
        mutate: Box<dyn FnOnce(&mut Session) + Send>,
    ) -> Result<Session, CoordError> {
        let mut session = self.get(sid).await?.ok_or(CoordError::NotFound)?;
        if session.version != expected_version {
            return Err(CoordError::Conflict);
        }
        session.status = next_status;
        mutate(&mut session);

        let affected = self.upsert_full(&session, Some(expected_version)).await?;
        if affected == 0 {
            self.hot.remove(&sid);
            return Err(CoordError::Conflict);
        }
        session.version += 1;
        self.hot.insert(sid, session.clone());
        Ok(session)
    }

    async fn incr(&self, sid: Uuid, fields: IncrFields) -> Result<Session, CoordError> {
        let row = sqlx::query(
            r#"
            UPDATE sessions SET
                joined = joined + $1, present = present + $2, total_scans = total_scans + $3,
                duplicate_attempts = duplicate_attempts + $4,
                invalid_token_attempts = invalid_token_attempts + $5,
                version = version + 1
            WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(fields.joined)
        .bind(fields.present)
        .bind(fields.scans)
        .bind(fields.duplicate_attempts)
        .bind(fields.invalid_token_attempts)
        .bind(sid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?
        .ok_or(CoordError::NotFound)?;

        let session = Self::row_to_session(&row)?;
        self.hot.insert(sid, session.clone());
        Ok(session)
    }

    async fn reap(&self, older_than_days: i64) -> Result<u64, CoordError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE status = 'ENDED' AND ended_at < now() - ($1 || ' days')::interval",
        )
        .bind(older_than_days.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;
        Ok(result.rows_affected())
    }

    async fn save_attendance_record(&self, record: AttendanceRecord) -> Result<(), CoordError> {
        sqlx::query(
            r#"
            INSERT INTO attendance_records (
                id, session_id, group_id, department, semester, section,
                total_students, present, absent, photos, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.session_id)
        .bind(record.group_id)
        .bind(&record.triple.department)
        .bind(&record.triple.semester)
        .bind(&record.triple.section)
        .bind(record.total_students)
        .bind(serde_json::to_value(&record.present).unwrap_or_default())
        .bind(serde_json::to_value(&record.absent).unwrap_or_default())
        .bind(serde_json::to_value(&record.photos).unwrap_or_default())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;
        Ok(())
    }

    async fn create_group(&self, group: GroupSession) -> Result<GroupSession, CoordError> {
        sqlx::query(
            r#"
            INSERT INTO group_sessions (
                id, faculty_id, faculty_name, faculty_email, status, current_token,
                token_expiry, refresh_count, created_at, locked_at, started_at, ended_at,
                version, rotator_owner
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(group.id)
        .bind(&group.faculty.faculty_id)
        .bind(&group.faculty.display_name)
        .bind(&group.faculty.email)
        .bind(status_str(group.status))
        .bind(&group.current_token)
        .bind(group.token_expiry)
        .bind(group.refresh_count)
        .bind(group.created_at)
        .bind(group.locked_at)
        .bind(group.started_at)
        .bind(group.ended_at)
        .bind(group.version)
        .bind(&group.rotator_owner)
        .execute(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;

        for member in &group.members {
            sqlx::query(
                "INSERT INTO group_members (group_id, session_id, department, semester, section, total_students) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(group.id)
            .bind(member.session_id)
            .bind(&member.triple.department)
            .bind(&member.triple.semester)
            .bind(&member.triple.section)
            .bind(member.total_students)
            .execute(&self.pool)
            .await
            .map_err(|_| CoordError::Transient)?;
        }
        Ok(group)
    }

    async fn get_group(&self, gid: Uuid) -> Result<Option<GroupSession>, CoordError> {
        let Some(row) =
            sqlx::query("SELECT * FROM group_sessions WHERE id = $1").bind(gid).fetch_optional(&self.pool).await.map_err(|_| CoordError::Transient)?
        else {
            return Ok(None);
        };

        let member_rows = sqlx::query("SELECT * FROM group_members WHERE group_id = $1 ORDER BY session_id")
            .bind(gid)
            .fetch_all(&self.pool)
            .await
            .map_err(|_| CoordError::Transient)?;

        let members = member_rows
            .iter()
            .map(|r| -> Result<GroupMember, CoordError> {
                Ok(GroupMember {
                    triple: Triple::new(
                        r.try_get::<String, _>("department").map_err(|_| CoordError::Internal)?,
                        r.try_get::<String, _>("semester").map_err(|_| CoordError::Internal)?,
                        r.try_get::<String, _>("section").map_err(|_| CoordError::Internal)?,
                    ),
                    session_id: r.try_get("session_id").map_err(|_| CoordError::Internal)?,
                    total_students: r.try_get("total_students").map_err(|_| CoordError::Internal)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let status_str: String = row.try_get("status").map_err(|_| CoordError::Internal)?;
        Ok(Some(GroupSession {
            id: row.try_get("id").map_err(|_| CoordError::Internal)?,
            faculty: FacultyRef {
                faculty_id: row.try_get("faculty_id").map_err(|_| CoordError::Internal)?,
                display_name: row.try_get("faculty_name").map_err(|_| CoordError::Internal)?,
                email: row.try_get("faculty_email").map_err(|_| CoordError::Internal)?,
            },
            members,
            status: parse_status(&status_str)?,
            current_token: row.try_get("current_token").map_err(|_| CoordError::Internal)?,
            token_expiry: row.try_get("token_expiry").map_err(|_| CoordError::Internal)?,
            refresh_count: row.try_get("refresh_count").map_err(|_| CoordError::Internal)?,
            created_at: row.try_get("created_at").map_err(|_| CoordError::Internal)?,
            locked_at: row.try_get("locked_at").map_err(|_| CoordError::Internal)?,
            started_at: row.try_get("started_at").map_err(|_| CoordError::Internal)?,
            ended_at: row.try_get("ended_at").map_err(|_| CoordError::Internal)?,
            version: row.try_get("version").map_err(|_| CoordError::Internal)?,
            rotator_owner: row.try_get("rotator_owner").map_err(|_| CoordError::Internal)?,
        }))
    }

    async fn transition_group(
        &self,
        gid: Uuid,
        expected_version: i64,
        next_status: SessionStatus,
        mutate: Box<dyn FnOnce(&mut GroupSession) + Send>,
    ) -> Result<GroupSession, CoordError> {
        let mut group = self.get_group(gid).await?.ok_or(CoordError::NotFound)?;
        if group.version != expected_version {
            return Err(CoordError::Conflict);
        }
        group.status = next_status;
        mutate(&mut group);

        let result = sqlx::query(
            r#"
            UPDATE group_sessions SET
                status = $1, current_token = $2, token_expiry = $3, refresh_count = $4,
                locked_at = $5, started_at = $6, ended_at = $7, version = version + 1,
                rotator_owner = $8
            WHERE id = $9 AND version = $10
            "#,
        )
        .bind(status_str(group.status))
        .bind(&group.current_token)
        .bind(group.token_expiry)
        .bind(group.refresh_count)
        .bind(group.locked_at)
        .bind(group.started_at)
        .bind(group.ended_at)
        .bind(&group.rotator_owner)
        .bind(gid)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;

        if result.rows_affected() == 0 {
            return Err(CoordError::Conflict);
        }
        group.version += 1;
        Ok(group)
    }

    async fn find_stale_rotators(&self, stale_secs: i64) -> Result<Vec<Session>, CoordError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'ACTIVE' \
             AND token_expiry < now() - ($1 || ' seconds')::interval",
        )
        .bind(stale_secs.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoordError::Transient)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn claim_rotator_owner(
        &self,
        sid: Uuid,
        expected_version: i64,
        worker_id: &str,
    ) -> Result<Session, CoordError> {
        self.transition(sid, expected_version, SessionStatus::Active, {
            let worker_id = worker_id.to_owned();
            Box::new(move |s| s.rotator_owner = Some(worker_id))
        })
        .await
    }
}

/// In-memory [`SessionStore`] used by integration tests, avoiding a live
/// Postgres dependency. Mirrors the same CAS semantics as [`PgSessionStore`].
#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct InMemorySessionStore {
        sessions: Mutex<std::collections::HashMap<Uuid, Session>>,
        groups: Mutex<std::collections::HashMap<Uuid, GroupSession>>,
        records: Mutex<Vec<AttendanceRecord>>,
    }

    #[async_trait]
    impl SessionStore for InMemorySessionStore {
        async fn create(&self, session: Session) -> Result<Session, CoordError> {
            let mut map = self.sessions.lock().map_err(|_| CoordError::Internal)?;
            if map.values().any(|s| s.triple == session.triple && s.status != SessionStatus::Ended) {
                return Err(CoordError::Conflict);
            }
            map.insert(session.id, session.clone());
            Ok(session)
        }

        async fn get(&self, sid: Uuid) -> Result<Option<Session>, CoordError> {
            Ok(self.sessions.lock().map_err(|_| CoordError::Internal)?.get(&sid).cloned())
        }

        async fn find_active_for_triple(&self, triple: &Triple) -> Result<Option<Session>, CoordError> {
            Ok(self
                .sessions
                .lock()
                .map_err(|_| CoordError::Internal)?
                .values()
                .find(|s| &s.triple == triple && s.status != SessionStatus::Ended)
                .cloned())
        }

        async fn transition(
            &self,
            sid: Uuid,
            expected_version: i64,
            next_status: SessionStatus,
            mutate: Box<dyn FnOnce(&mut Session) + Send>,
        ) -> Result<Session, CoordError> {
            let mut map = self.sessions.lock().map_err(|_| CoordError::Internal)?;
            let session = map.get_mut(&sid).ok_or(CoordError::NotFound)?;
            if session.version != expected_version {
                return Err(CoordError::Conflict);
            }
            session.status = next_status;
            mutate(session);
            session.version += 1;
            Ok(session.clone())
        }

        async fn incr(&self, sid: Uuid, fields: IncrFields) -> Result<Session, CoordError> {
            let mut map = self.sessions.lock().map_err(|_| CoordError::Internal)?;
            let session = map.get_mut(&sid).ok_or(CoordError::NotFound)?;
            session.counters.joined += fields.joined;
            session.counters.present += fields.present;
            session.counters.total_scans += fields.scans;
            session.counters.duplicate_attempts += fields.duplicate_attempts;
            session.counters.invalid_token_attempts += fields.invalid_token_attempts;
            session.version += 1;
            Ok(session.clone())
        }

        async fn reap(&self, _older_than_days: i64) -> Result<u64, CoordError> {
            Ok(0)
        }

        async fn save_attendance_record(&self, record: AttendanceRecord) -> Result<(), CoordError> {
            self.records.lock().map_err(|_| CoordError::Internal)?.push(record);
            Ok(())
        }

        async fn create_group(&self, group: GroupSession) -> Result<GroupSession, CoordError> {
            self.groups.lock().map_err(|_| CoordError::Internal)?.insert(group.id, group.clone());
            Ok(group)
        }

        async fn get_group(&self, gid: Uuid) -> Result<Option<GroupSession>, CoordError> {
            Ok(self.groups.lock().map_err(|_| CoordError::Internal)?.get(&gid).cloned())
        }

        async fn transition_group(
            &self,
            gid: Uuid,
            expected_version: i64,
            next_status: SessionStatus,
            mutate: Box<dyn FnOnce(&mut GroupSession) + Send>,
        ) -> Result<GroupSession, CoordError> {
            let mut map = self.groups.lock().map_err(|_| CoordError::Internal)?;
            let group = map.get_mut(&gid).ok_or(CoordError::NotFound)?;
            if group.version != expected_version {
                return Err(CoordError::Conflict);
            }
            group.status = next_status;
            mutate(group);
            group.version += 1;
            Ok(group.clone())
        }

        async fn find_stale_rotators(&self, stale_secs: i64) -> Result<Vec<Session>, CoordError> {
            let threshold = Utc::now() - chrono::Duration::seconds(stale_secs);
            Ok(self
                .sessions
                .lock()
                .map_err(|_| CoordError::Internal)?
                .values()
                .filter(|s| s.status == SessionStatus::Active && s.token_expiry.map(|e| e < threshold).unwrap_or(false))
                .cloned()
                .collect())
        }

        async fn claim_rotator_owner(
            &self,
            sid: Uuid,
            expected_version: i64,
            worker_id: &str,
        ) -> Result<Session, CoordError> {
            self.transition(sid, expected_version, SessionStatus::Active, {
                let worker_id = worker_id.to_owned();
                Box::new(move |s| s.rotator_owner = Some(worker_id))
            })
            .await
        }
    }
}
