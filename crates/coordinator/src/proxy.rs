// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proxy-Detection Gate (spec §4.8, component C8): authenticated
//! self-removal of a student from both cache sets of their active section.

use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::identity::StudentRef;
use crate::model::Triple;

/// Which set(s) the student was removed from (spec §4.8 "Returns which
/// set(s) the student was in").
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalResult {
    pub removed_from_joined: bool,
    pub removed_from_attended: bool,
}

/// `removeStudent(studentId, rollNumber, triple, reason)` (spec §4.8).
pub async fn remove_student(
    coord: &Coordinator,
    caller: &StudentRef,
    student_id: &str,
    roll_number: &str,
    triple: &Triple,
    _reason: &str,
) -> Result<RemovalResult, CoordError> {
    let credential_matches = (caller.student_id == student_id || caller.roll_number == roll_number)
        && caller.triple.semester == triple.semester
        && caller.triple.section == triple.section;
    if !credential_matches {
        return Err(CoordError::AuthZ);
    }

    let session = coord.store.find_active_for_triple(triple).await?.ok_or(CoordError::NoActiveSession)?;

    let outcome = coord
        .cache
        .pipelined_remove_pair(&session.joined_key(), student_id, &session.attended_key(), roll_number)
        .await;

    let (removed_from_joined, removed_from_attended) = outcome.into_option().unwrap_or((false, false));
    Ok(RemovalResult { removed_from_joined, removed_from_attended })
}

/// `studentStatus`: whether the caller currently appears in either set of
/// their active session, used by the HTTP mirror `/proxy/student-status`.
pub async fn student_status(
    coord: &Coordinator,
    student_id: &str,
    roll_number: &str,
    triple: &Triple,
) -> Result<RemovalResult, CoordError> {
    let session = coord.store.find_active_for_triple(triple).await?.ok_or(CoordError::NoActiveSession)?;

    let joined = coord.cache.set_ismember(&session.joined_key(), student_id).await.into_option().unwrap_or(false);
    let attended =
        coord.cache.set_ismember(&session.attended_key(), roll_number).await.into_option().unwrap_or(false);

    Ok(RemovalResult { removed_from_joined: joined, removed_from_attended: attended })
}
