// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attendance session coordinator: lifecycle state machine, rotating-token
//! authenticator, dual-cache membership layer, realtime fan-out, and
//! proxy-detection removal for instructor-led attendance sessions.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod devicebinding;
pub mod error;
pub mod group;
pub mod identity;
pub mod model;
pub mod proxy;
pub mod room;
pub mod rotator;
pub mod store;
pub mod token;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ring::hmac;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::devicebinding::DeviceBindingCache;
use crate::group::GroupCoordinator;
use crate::room::RoomRegistry;
use crate::rotator::{RotatorSink, RotatorTable};
use crate::store::{PgSessionStore, SessionStore};
use crate::token::TokenMint;
use crate::transport::build_router;
use crate::transport::fabric::Fabric;

/// Process-wide shared state, assembled once in [`run`] and handed to every
/// request handler behind an `Arc`.
pub struct AppState {
    pub config: CoordinatorConfig,
    pub coordinator: Coordinator,
    pub group: GroupCoordinator,
    pub rooms: RoomRegistry,
    pub fabric: Option<Fabric>,
    pub rotators: Arc<RotatorTable>,
    pub identity_key: hmac::Key,
    pub worker_id: String,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn rotator_sink(&self) -> RotatorSink {
        RotatorSink { rooms: self.rooms.clone(), fabric: self.fabric.clone() }
    }
}

/// Run the coordinator server until shutdown.
pub async fn run(config: CoordinatorConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let shutdown = CancellationToken::new();
    let worker_id = config.cluster_worker.clone().unwrap_or_else(generate_worker_id);

    let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::connect(&config.db_uri).await?);

    let cache = match SharedCache::connect(&config.redis_url).await {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(err = %e, "shared cache unreachable at startup, starting degraded");
            SharedCache::disabled()
        }
    };
    let cache = Arc::new(cache);

    let identity_source: Arc<dyn devicebinding::IdentitySource> = Arc::new(ExternalIdentityStore);
    let bindings = Arc::new(DeviceBindingCache::new(identity_source, config.section_cache_ttl()));

    let tokens = Arc::new(TokenMint::new(&config.jwt_secret, config.token_window()));
    token::spawn_sweeper(Arc::clone(&tokens), shutdown.clone());

    let coordinator = Coordinator {
        store: Arc::clone(&store),
        cache: Arc::clone(&cache),
        bindings,
        tokens: Arc::clone(&tokens),
        membership_ttl: config.membership_ttl(),
    };
    let group = GroupCoordinator { single: coordinator.clone(), tokens: Arc::clone(&tokens) };

    let rooms = RoomRegistry::new();
    let fabric = match Fabric::connect(&config.nats_url, &config.nats_prefix).await {
        Ok(fabric) => {
            fabric.clone().spawn_subscriber(rooms.clone(), shutdown.clone());
            Some(fabric)
        }
        Err(e) => {
            tracing::warn!(err = %e, "realtime fabric unreachable, cross-worker fan-out disabled");
            None
        }
    };

    let identity_key = hmac::Key::new(hmac::HMAC_SHA256, config.jwt_secret.as_bytes());
    let rotators = Arc::new(RotatorTable::new());

    let state = Arc::new(AppState {
        config: config.clone(),
        coordinator,
        group,
        rooms,
        fabric,
        rotators: Arc::clone(&rotators),
        identity_key,
        worker_id: worker_id.clone(),
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
    });

    if config.is_master() {
        rotator::spawn_orphan_reaper(
            state.coordinator.clone(),
            Arc::clone(&rotators),
            state.rotator_sink(),
            worker_id,
            config.rotator_stale(),
            Duration::from_secs(5),
            shutdown.clone(),
        );
        store::spawn_reaper(Arc::clone(&store), config.reap_retention_days, config.reap_interval(), shutdown.clone());
    }

    tracing::info!(addr, worker = %state.worker_id, "attendance coordinator listening");

    let router = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// Placeholder wiring to the external identity system (spec §1 Non-goals:
/// identity management is out of scope). A real deployment substitutes its
/// own [`devicebinding::IdentitySource`] implementation here.
struct ExternalIdentityStore;

#[async_trait::async_trait]
impl devicebinding::IdentitySource for ExternalIdentityStore {
    async fn section_fingerprints(&self, _triple: &model::Triple) -> anyhow::Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Unique per-process worker identifier, used as the rotator-ownership
/// token when no `CLUSTER_WORKER` env var is set.
pub fn generate_worker_id() -> String {
    Uuid::new_v4().to_string()
}
