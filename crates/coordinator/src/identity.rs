// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Caller identity resolution (spec §4.7, §6).
//!
//! Identity management itself is out of scope (spec §1 Non-goals): the
//! coordinator does not register users or issue login credentials. It only
//! resolves the bearer credential presented at the transport boundary into a
//! typed [`Identity`], the same way it resolves a C1 token envelope — base64url
//! JSON signed with the process HMAC key, minted by the external identity
//! system this coordinator is deployed alongside.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::CoordError;
use crate::model::{FacultyRef, Triple};

/// A resolved caller, faculty or student.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Identity {
    Faculty(FacultyRef),
    Student(StudentRef),
}

/// Student-side credential fields (spec §4.8 enforcement fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub student_id: String,
    pub roll_number: String,
    pub triple: Triple,
    pub email: String,
    pub fingerprint: Option<String>,
}

impl Identity {
    pub fn faculty(&self) -> Result<&FacultyRef, CoordError> {
        match self {
            Self::Faculty(f) => Ok(f),
            Self::Student(_) => Err(CoordError::AuthZ),
        }
    }

    pub fn student(&self) -> Result<&StudentRef, CoordError> {
        match self {
            Self::Student(s) => Ok(s),
            Self::Faculty(_) => Err(CoordError::AuthZ),
        }
    }
}

/// Verifies a bearer credential against the process HMAC key and decodes the
/// [`Identity`] it carries. Mirrors [`crate::token`]'s envelope shape: the
/// credential is `payload || '.' || signature`, both base64url.
pub fn resolve_bearer(key: &hmac::Key, credential: &str) -> Result<Identity, CoordError> {
    let (payload_b64, sig_b64) = credential.split_once('.').ok_or(CoordError::AuthN)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| CoordError::AuthN)?;
    let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| CoordError::AuthN)?;

    hmac::verify(key, &payload, &sig).map_err(|_| CoordError::AuthN)?;

    serde_json::from_slice(&payload).map_err(|_| CoordError::AuthN)
}

/// Extracts the bearer token from an `Authorization: Bearer <token>` header value.
pub fn strip_bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}
