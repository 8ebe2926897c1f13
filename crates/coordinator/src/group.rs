// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Group Coordinator (spec §4.6, component C6): wraps N sibling sessions
//! under one token stream and aggregated stats. Depends only on the
//! single-session [`Coordinator`] — never the reverse.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::model::{FacultyRef, GroupMember, GroupSession, SessionMode, SessionStatus, Triple};
use crate::store;
use crate::token::TokenMint;

#[derive(Clone)]
pub struct GroupCoordinator {
    pub single: Coordinator,
    pub tokens: Arc<TokenMint>,
}

impl GroupCoordinator {
    fn authorize(group: &GroupSession, caller: &FacultyRef) -> Result<(), CoordError> {
        if group.faculty.faculty_id == caller.faculty_id {
            Ok(())
        } else {
            Err(CoordError::AuthZ)
        }
    }

    /// Creates the group and every member session, each as a CREATED sibling
    /// (spec §4.6 "transitions are applied per-member and to the group
    /// atomically from the faculty's perspective").
    pub async fn start_group(
        &self,
        triples: Vec<(Triple, i64)>,
        mode: SessionMode,
        faculty: FacultyRef,
    ) -> Result<GroupSession, CoordError> {
        let now = Utc::now();
        let mut members = Vec::with_capacity(triples.len());
        for (triple, expected_size) in triples {
            let session = store::start_session(
                &*self.single.store,
                triple.clone(),
                faculty.clone(),
                expected_size,
                mode,
                now,
            )
            .await?;
            self.single
                .bindings
                .preload(&self.single.cache, &triple)
                .await
                .map_err(|_| CoordError::Transient)?;
            members.push(GroupMember { triple, session_id: session.id, total_students: expected_size });
        }

        let group = GroupSession::new(faculty, members.clone(), now);
        let group = self.single.store.create_group(group).await?;

        for member in &members {
            self.single
                .store
                .transition(
                    member.session_id,
                    1,
                    SessionStatus::Created,
                    Box::new({
                        let gid = group.id;
                        move |s| s.group_id = Some(gid)
                    }),
                )
                .await
                .ok();
        }
        Ok(group)
    }

    pub async fn lock_group(&self, gid: Uuid, caller: &FacultyRef) -> Result<GroupSession, CoordError> {
        self.transition_all(gid, caller, SessionStatus::Created, SessionStatus::Locked, |s| {
            s.locked_at = Some(Utc::now())
        })
        .await
    }

    pub async fn unlock_group(&self, gid: Uuid, caller: &FacultyRef) -> Result<GroupSession, CoordError> {
        self.transition_all(gid, caller, SessionStatus::Locked, SessionStatus::Created, |s| {
            s.locked_at = None
        })
        .await
    }

    /// `group` enters ACTIVE: stops each member rotator (member sessions
    /// simply stop minting — ownership is taken over here), mints one group
    /// token, and mirrors it into every member (spec §4.6).
    pub async fn start_attendance_group(
        &self,
        gid: Uuid,
        caller: &FacultyRef,
        worker_id: &str,
    ) -> Result<GroupSession, CoordError> {
        let group = self.single.store.get_group(gid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize(&group, caller)?;
        if group.status != SessionStatus::Locked {
            return Err(CoordError::PreconditionState);
        }

        let (token, expiry) = self.tokens.mint(gid, crate::model::TokenKind::Group);
        let now = Utc::now();
        let worker_id_owned = worker_id.to_owned();
        let group = self
            .single
            .store
            .transition_group(
                gid,
                group.version,
                SessionStatus::Active,
                Box::new(move |g| {
                    g.started_at = Some(now);
                    g.current_token = Some(token.clone());
                    g.token_expiry = Some(expiry);
                    g.refresh_count = 1;
                    g.rotator_owner = Some(worker_id_owned);
                }),
            )
            .await?;

        self.mirror_token_to_members(&group).await?;
        Ok(group)
    }

    /// Mirrors the group's current token into every member session in one
    /// batch (spec §4.9 step 4, §4.6).
    pub async fn mirror_token_to_members(&self, group: &GroupSession) -> Result<(), CoordError> {
        for member in &group.members {
            let token = group.current_token.clone();
            let expiry = group.token_expiry;
            let refresh_count = group.refresh_count;
            if let Some(session) = self.single.store.get(member.session_id).await? {
                self.single
                    .store
                    .transition(
                        member.session_id,
                        session.version,
                        SessionStatus::Active,
                        Box::new(move |s| {
                            s.current_token = token;
                            s.token_expiry = expiry;
                            s.refresh_count = refresh_count;
                        }),
                    )
                    .await
                    .ok();
            }
        }
        Ok(())
    }

    /// Ending a member individually does not end the group; ending the group
    /// ends each member (spec §4.6).
    pub async fn end_group(&self, gid: Uuid, caller: &FacultyRef) -> Result<GroupSession, CoordError> {
        let group = self.single.store.get_group(gid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize(&group, caller)?;
        if group.status == SessionStatus::Ended {
            return Err(CoordError::PreconditionState);
        }

        self.tokens.invalidate_by_session(gid);
        for member in &group.members {
            self.single.end_session(member.session_id, caller).await.ok();
        }

        let now = Utc::now();
        self.single
            .store
            .transition_group(
                gid,
                group.version,
                SessionStatus::Ended,
                Box::new(move |g| {
                    g.ended_at = Some(now);
                    g.current_token = None;
                    g.token_expiry = None;
                    g.rotator_owner = None;
                }),
            )
            .await
    }

    /// Pipelined batch over every member's cache sets (spec §4.6 "Aggregated
    /// stats at each transition come from a pipelined batch").
    pub async fn aggregated_stats(&self, group: &GroupSession) -> Vec<(Triple, i64, i64)> {
        let joined_keys: Vec<String> =
            group.members.iter().map(|m| format!("session:{}:joined", m.session_id)).collect();
        let attended_keys: Vec<String> =
            group.members.iter().map(|m| format!("session:{}:attended", m.session_id)).collect();

        let joined = self.single.cache.set_cards_batch(&joined_keys).await.into_option();
        let attended = self.single.cache.set_cards_batch(&attended_keys).await.into_option();

        group
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let j = joined.as_ref().and_then(|v| v.get(i)).copied().unwrap_or(0);
                let a = attended.as_ref().and_then(|v| v.get(i)).copied().unwrap_or(0);
                (m.triple.clone(), j, a)
            })
            .collect()
    }

    async fn transition_all(
        &self,
        gid: Uuid,
        caller: &FacultyRef,
        expected: SessionStatus,
        next: SessionStatus,
        mutate_group: impl FnOnce(&mut GroupSession) + Send + 'static,
    ) -> Result<GroupSession, CoordError> {
        let group = self.single.store.get_group(gid).await?.ok_or(CoordError::NotFound)?;
        Self::authorize(&group, caller)?;
        if group.status != expected {
            return Err(CoordError::PreconditionState);
        }

        for member in &group.members {
            if let Some(session) = self.single.store.get(member.session_id).await? {
                self.single.store.transition(member.session_id, session.version, next, Box::new(|_| {})).await.ok();
            }
        }

        self.single.store.transition_group(gid, group.version, next, Box::new(mutate_group)).await
    }

    /// `incr(joined)` for a group's member resolved by the joining student's
    /// triple, used when a student joins a grouped session.
    pub async fn join_member(&self, group: &GroupSession, student_id: &str, triple: &Triple) -> Result<(), CoordError> {
        let member = group.resolve_member(triple).ok_or(CoordError::Validation)?;
        self.single.join(member.session_id, student_id, triple).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::SharedCache;
    use crate::devicebinding::DeviceBindingCache;
    use crate::store::InMemorySessionStore;

    fn faculty() -> FacultyRef {
        FacultyRef { faculty_id: "f1".into(), display_name: "Dr. Lin".into(), email: "lin@example.edu".into() }
    }

    struct NoopIdentitySource;

    #[async_trait::async_trait]
    impl crate::devicebinding::IdentitySource for NoopIdentitySource {
        async fn section_fingerprints(&self, _triple: &Triple) -> anyhow::Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }
    }

    fn harness() -> GroupCoordinator {
        let tokens = Arc::new(TokenMint::new("test-secret", Duration::from_secs(7)));
        let single = Coordinator {
            store: Arc::new(InMemorySessionStore::default()),
            cache: Arc::new(SharedCache::in_memory()),
            bindings: Arc::new(DeviceBindingCache::new(Arc::new(NoopIdentitySource), Duration::from_secs(300))),
            tokens: Arc::clone(&tokens),
            membership_ttl: Duration::from_secs(7200),
        };
        GroupCoordinator { single, tokens }
    }

    /// A member of a group scans the group's mirrored token, not a
    /// per-member `Single` token — the single-session `Coordinator::scan`
    /// must verify against `TokenKind::Group` for a session carrying a
    /// `group_id` (spec §4.6, scenario 5).
    #[tokio::test]
    async fn group_member_scan_accepts_the_mirrored_group_token() {
        let group_coord = harness();
        let t1 = Triple::new("CS", "2026A", "01");
        let t2 = Triple::new("CS", "2026A", "02");

        let group = group_coord
            .start_group(vec![(t1.clone(), 30), (t2.clone(), 25)], SessionMode::RollBased, faculty())
            .await
            .unwrap();
        group_coord.join_member(&group, "s1", &t1).await.unwrap();
        let group = group_coord.lock_group(group.id, &faculty()).await.unwrap();
        let group = group_coord.start_attendance_group(group.id, &faculty(), "worker-1").await.unwrap();

        let member = group.resolve_member(&t1).unwrap();
        let session = group_coord.single.store.get(member.session_id).await.unwrap().unwrap();
        assert_eq!(session.current_token, group.current_token);

        let token = session.current_token.clone().unwrap();
        let outcome = group_coord
            .single
            .scan(member.session_id, "s1", "01", &t1, &token, None)
            .await
            .unwrap();
        assert!(!outcome.already_marked);
    }
}
