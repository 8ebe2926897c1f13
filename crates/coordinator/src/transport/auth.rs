// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::CoordError;
use crate::identity::{self, Identity};
use crate::AppState;

/// Resolves the bearer credential from an HTTP `Authorization` header.
pub fn identity_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Identity, CoordError> {
    let header = headers.get("authorization").and_then(|v| v.to_str().ok()).ok_or(CoordError::AuthN)?;
    let token = identity::strip_bearer(header).ok_or(CoordError::AuthN)?;
    identity::resolve_bearer(&state.identity_key, token)
}

/// Resolves the bearer credential from a WebSocket upgrade's `?token=...`
/// query string (spec §4.7 "Authentication occurs during handshake").
pub fn identity_from_query(state: &AppState, query: &str) -> Result<Identity, CoordError> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            return identity::resolve_bearer(&state.identity_key, value);
        }
    }
    Err(CoordError::AuthN)
}

/// Axum middleware enforcing bearer authentication on the HTTP surface.
/// Exempt: `/status` (liveness) and WebSocket upgrades, which authenticate
/// during the handshake instead.
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/status" || path.starts_with("/ws") {
        return next.run(req).await;
    }

    match identity_from_headers(&state, req.headers()) {
        Ok(identity) => {
            let mut req = req;
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(code) => code.to_http_response("missing or invalid credential").into_response(),
    }
}
