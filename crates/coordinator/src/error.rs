// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the session coordinator (spec §7).

use std::fmt;

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error kinds surfaced to callers, HTTP or realtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordError {
    AuthN,
    AuthZ,
    Validation,
    PreconditionState,
    NotFound,
    Conflict,
    TokenNotFound,
    TokenExpired,
    TokenBadSignature,
    TokenWrongKind,
    AlreadyJoined,
    AlreadyMarked,
    NotJoined,
    SuspectedProxy,
    NoActiveSession,
    Transient,
    Internal,
}

impl CoordError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation | Self::PreconditionState | Self::AlreadyJoined | Self::AlreadyMarked => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthN => StatusCode::UNAUTHORIZED,
            Self::AuthZ => StatusCode::FORBIDDEN,
            Self::NotFound | Self::NoActiveSession | Self::NotJoined => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::TokenNotFound
            | Self::TokenExpired
            | Self::TokenBadSignature
            | Self::TokenWrongKind
            | Self::SuspectedProxy => StatusCode::GONE,
            Self::Transient => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthN => "AUTHN",
            Self::AuthZ => "AUTHZ",
            Self::Validation => "VALIDATION",
            Self::PreconditionState => "PRECONDITION_STATE",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenBadSignature => "TOKEN_BAD_SIGNATURE",
            Self::TokenWrongKind => "TOKEN_WRONG_KIND",
            Self::AlreadyJoined => "ALREADY_JOINED",
            Self::AlreadyMarked => "ALREADY_MARKED",
            Self::NotJoined => "NOT_JOINED",
            Self::SuspectedProxy => "SUSPECTED_PROXY",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::Transient => "TRANSIENT",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(&self, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
        (self.http_status(), Json(ErrorResponse { error: self.to_error_body(message) }))
    }

    /// Realtime clients receive `error {message}` (§6); this renders that payload.
    pub fn to_ws_event(&self, message: impl Into<String>) -> serde_json::Value {
        serde_json::json!({ "event": "error", "message": message.into(), "code": self.as_str() })
    }
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for CoordError {}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Reason a token failed verification (§4.1), folded into [`CoordError`] at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailReason {
    NotFound,
    Expired,
    InvalidSignature,
    WrongKind,
}

impl From<TokenFailReason> for CoordError {
    fn from(reason: TokenFailReason) -> Self {
        match reason {
            TokenFailReason::NotFound => CoordError::TokenNotFound,
            TokenFailReason::Expired => CoordError::TokenExpired,
            TokenFailReason::InvalidSignature => CoordError::TokenBadSignature,
            TokenFailReason::WrongKind => CoordError::TokenWrongKind,
        }
    }
}
