// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the session coordinator process.
#[derive(Debug, Clone, clap::Args)]
pub struct CoordinatorConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "PORT_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "PORT")]
    pub port: u16,

    /// CORS origin allowlist (comma-separated). Empty means permissive (dev only).
    #[arg(long, env = "FRONTEND_URL", value_delimiter = ',')]
    pub frontend_url: Vec<String>,

    /// Postgres connection string backing the Session Store (C4).
    #[arg(long, env = "DB_URI")]
    pub db_uri: String,

    /// Secret used to sign token envelopes (C1). Process refuses to start without it.
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: String,

    /// Shared cache (Redis) connection string (C2).
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "REDIS_URL")]
    pub redis_url: String,

    /// Cross-worker realtime fabric (NATS) connection string (C7).
    #[arg(long, default_value = "nats://127.0.0.1:4222", env = "NATS_URL")]
    pub nats_url: String,

    /// Subject prefix for the realtime fabric, namespacing multiple deployments.
    #[arg(long, default_value = "attend", env = "NATS_PREFIX")]
    pub nats_prefix: String,

    /// Token rotation period in seconds (§4.9).
    #[arg(long, default_value_t = 5, env = "TOKEN_ROTATE_SECS")]
    pub token_rotate_secs: u64,

    /// Token validity window in seconds (5s advertised refresh + 2s grace, §3).
    #[arg(long, default_value_t = 7, env = "TOKEN_WINDOW_SECS")]
    pub token_window_secs: u64,

    /// Join-set / attendance-set TTL in seconds (§4.2).
    #[arg(long, default_value_t = 7200, env = "MEMBERSHIP_TTL_SECS")]
    pub membership_ttl_secs: u64,

    /// Section-wide device-binding cache TTL in seconds (§4.3).
    #[arg(long, default_value_t = 300, env = "SECTION_CACHE_TTL_SECS")]
    pub section_cache_ttl_secs: u64,

    /// Default deadline for Store/Cache calls, in milliseconds (§5).
    #[arg(long, default_value_t = 3000, env = "CALL_DEADLINE_MS")]
    pub call_deadline_ms: u64,

    /// Deadline for the token-rotator path specifically, in milliseconds (§5).
    #[arg(long, default_value_t = 1000, env = "ROTATOR_DEADLINE_MS")]
    pub rotator_deadline_ms: u64,

    /// Staleness threshold (seconds) before the maintenance loop re-elects a
    /// rotator owner for an ACTIVE session (§4.9).
    #[arg(long, default_value_t = 15, env = "ROTATOR_STALE_SECS")]
    pub rotator_stale_secs: u64,

    /// Age in days after which an ENDED session is reaped from the Session
    /// Store by the master-only maintenance loop (§4.4 `reap`).
    #[arg(long, default_value_t = 90, env = "REAP_RETENTION_DAYS")]
    pub reap_retention_days: i64,

    /// Interval in seconds between maintenance-loop reap sweeps.
    #[arg(long, default_value_t = 3600, env = "REAP_INTERVAL_SECS")]
    pub reap_interval_secs: u64,

    /// Identifies this process as a forked worker in a clustered deployment.
    /// Set by the process manager; unset means "run the master-only
    /// maintenance loops as well" (§5).
    #[arg(long, env = "CLUSTER_WORKER")]
    pub cluster_worker: Option<String>,
}

impl CoordinatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn token_rotate_interval(&self) -> Duration {
        Duration::from_secs(self.token_rotate_secs)
    }

    pub fn token_window(&self) -> Duration {
        Duration::from_secs(self.token_window_secs)
    }

    pub fn membership_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_ttl_secs)
    }

    pub fn section_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.section_cache_ttl_secs)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }

    pub fn rotator_deadline(&self) -> Duration {
        Duration::from_millis(self.rotator_deadline_ms)
    }

    pub fn rotator_stale(&self) -> Duration {
        Duration::from_secs(self.rotator_stale_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// A master-only maintenance loop runs when this process isn't a forked worker.
    pub fn is_master(&self) -> bool {
        self.cluster_worker.is_none()
    }
}
