// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the attendance session coordinator.

pub mod auth;
pub mod fabric;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the axum `Router` with every route from spec §6.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = if state.config.frontend_url.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = state
            .config
            .frontend_url
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .route("/status", get(http::status))
        .route("/ws", get(ws::ws_handler))
        // Faculty mirrors
        .route("/qr/start-session", post(http::start_session))
        .route("/qr/lock-session", post(http::lock_session))
        .route("/qr/unlock-session", post(http::unlock_session))
        .route("/qr/start-attendance", post(http::start_attendance))
        .route("/qr/end-session", post(http::end_session))
        // Student mirrors
        .route("/qr/join-session", post(http::join_session))
        .route("/qr/scan-qr", post(http::scan_qr))
        .route("/qr/validate-qr", post(http::validate_qr))
        .route("/qr/session-status", get(http::session_status))
        // Proxy-detection gate
        .route("/proxy/remove-student", post(http::remove_student))
        .route("/proxy/student-status", post(http::student_status))
        .route("/proxy/session-stats/{sid}", get(http::session_stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
