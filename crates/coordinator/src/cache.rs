// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared Cache (spec §4.2, component C2): a network-visible KV + set store
//! with TTL and pipelined batches, that degrades to a typed miss rather than
//! an error when the transport is unavailable.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Outcome of a cache operation: a value, an authoritative miss, or a
/// transport failure the caller must treat as a miss (spec §4.2 fallback
/// discipline — "every operation returns a well-defined miss/no-op value").
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Hit(T),
    Miss,
    Degraded,
}

impl<T> Outcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(v) => Some(v),
            Self::Miss | Self::Degraded => None,
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    kv: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
}

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    /// Real set/KV semantics with no TTL enforcement and no transport to
    /// fail, used by tests that need the dedup/membership logic to actually
    /// work rather than exercising the degraded fallback path.
    Memory(std::sync::Arc<Mutex<MemoryStore>>),
    Disabled,
}

/// Thin wrapper over a Redis connection manager. Every method swallows
/// transport errors into [`Outcome::Degraded`] rather than propagating them;
/// callers fall back to the Session Store per spec §4.2/§5.
///
/// [`SharedCache::disabled`] is always degraded, used by tests and
/// deployments that exercise the fallback-to-Store paths without a live
/// Redis. [`SharedCache::in_memory`] instead backs the same API with a
/// plain process-local map, for tests that need real membership semantics.
#[derive(Clone)]
pub struct SharedCache {
    backend: Backend,
}

impl SharedCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { backend: Backend::Redis(conn) })
    }

    /// A cache that is always degraded. Used by tests exercising the
    /// fallback-to-Store paths without a live Redis.
    pub fn disabled() -> Self {
        Self { backend: Backend::Disabled }
    }

    /// A cache backed by a process-local map instead of Redis. TTLs are
    /// accepted but not enforced. Used by tests that exercise dedup/CAS
    /// logic end to end without a live Redis.
    pub fn in_memory() -> Self {
        Self { backend: Backend::Memory(std::sync::Arc::new(Mutex::new(MemoryStore::default()))) }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Outcome<T> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return match store.kv.get(key) {
                    Some(s) => match serde_json::from_str(s) {
                        Ok(v) => Outcome::Hit(v),
                        Err(_) => Outcome::Degraded,
                    },
                    None => Outcome::Miss,
                };
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let raw: Result<Option<String>, redis::RedisError> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match raw {
            Ok(Some(s)) => match serde_json::from_str(&s) {
                Ok(v) => Outcome::Hit(v),
                Err(e) => {
                    warn!(key, err = %e, "cache value failed to deserialize");
                    Outcome::Degraded
                }
            },
            Ok(None) => Outcome::Miss,
            Err(e) => {
                warn!(key, err = %e, "cache GET failed, degrading");
                Outcome::Degraded
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let Ok(serialized) = serde_json::to_string(value) else { return false };
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(mut store) = m.lock() else { return false };
                store.kv.insert(key.to_string(), serialized);
                return true;
            }
            Backend::Disabled => return false,
        };
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(serialized)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await;
        if let Err(e) = &result {
            warn!(key, err = %e, "cache SET failed");
        }
        result.is_ok()
    }

    pub async fn del(&self, key: &str) -> bool {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(mut store) = m.lock() else { return false };
                store.kv.remove(key);
                store.sets.remove(key);
                return true;
            }
            Backend::Disabled => return false,
        };
        let result: Result<(), redis::RedisError> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(e) = &result {
            warn!(key, err = %e, "cache DEL failed");
        }
        result.is_ok()
    }

    pub async fn exists(&self, key: &str) -> Outcome<bool> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return Outcome::Hit(store.kv.contains_key(key) || store.sets.contains_key(key));
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let result: Result<bool, redis::RedisError> =
            redis::cmd("EXISTS").arg(key).query_async(&mut conn).await;
        match result {
            Ok(v) => Outcome::Hit(v),
            Err(e) => {
                warn!(key, err = %e, "cache EXISTS failed, degrading");
                Outcome::Degraded
            }
        }
    }

    /// `add`: adds `member` to the set at `key`, resetting its TTL. Idempotent.
    pub async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Outcome<bool> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(mut store) = m.lock() else { return Outcome::Degraded };
                let added = store.sets.entry(key.to_string()).or_default().insert(member.to_string());
                return Outcome::Hit(added);
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let added: Result<i64, redis::RedisError> =
            redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await;
        match added {
            Ok(n) => {
                let _: Result<(), redis::RedisError> =
                    redis::cmd("EXPIRE").arg(key).arg(ttl.as_secs()).query_async(&mut conn).await;
                Outcome::Hit(n > 0)
            }
            Err(e) => {
                warn!(key, err = %e, "cache SADD failed, degrading");
                Outcome::Degraded
            }
        }
    }

    pub async fn set_ismember(&self, key: &str, member: &str) -> Outcome<bool> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return Outcome::Hit(store.sets.get(key).is_some_and(|s| s.contains(member)));
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let result: Result<bool, redis::RedisError> =
            redis::cmd("SISMEMBER").arg(key).arg(member).query_async(&mut conn).await;
        match result {
            Ok(v) => Outcome::Hit(v),
            Err(e) => {
                warn!(key, err = %e, "cache SISMEMBER failed, degrading");
                Outcome::Degraded
            }
        }
    }

    pub async fn set_members(&self, key: &str) -> Outcome<Vec<String>> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return Outcome::Hit(store.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default());
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let result: Result<Vec<String>, redis::RedisError> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await;
        match result {
            Ok(v) => Outcome::Hit(v),
            Err(e) => {
                warn!(key, err = %e, "cache SMEMBERS failed, degrading");
                Outcome::Degraded
            }
        }
    }

    pub async fn set_remove(&self, key: &str, member: &str) -> Outcome<bool> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(mut store) = m.lock() else { return Outcome::Degraded };
                let removed = store.sets.get_mut(key).is_some_and(|s| s.remove(member));
                return Outcome::Hit(removed);
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let result: Result<i64, redis::RedisError> =
            redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await;
        match result {
            Ok(n) => Outcome::Hit(n > 0),
            Err(e) => {
                warn!(key, err = %e, "cache SREM failed, degrading");
                Outcome::Degraded
            }
        }
    }

    pub async fn set_card(&self, key: &str) -> Outcome<i64> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return Outcome::Hit(store.sets.get(key).map(|s| s.len() as i64).unwrap_or(0));
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let result: Result<i64, redis::RedisError> =
            redis::cmd("SCARD").arg(key).query_async(&mut conn).await;
        match result {
            Ok(v) => Outcome::Hit(v),
            Err(e) => {
                warn!(key, err = %e, "cache SCARD failed, degrading");
                Outcome::Degraded
            }
        }
    }

    /// Pipelined batch: cardinalities of several sets in one round trip,
    /// used by the Group Coordinator's aggregated stats (spec §4.6).
    pub async fn set_cards_batch(&self, keys: &[String]) -> Outcome<Vec<i64>> {
        if keys.is_empty() {
            return Outcome::Hit(Vec::new());
        }
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(store) = m.lock() else { return Outcome::Degraded };
                return Outcome::Hit(keys.iter().map(|k| store.sets.get(k).map(|s| s.len() as i64).unwrap_or(0)).collect());
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("SCARD").arg(key);
        }
        let result: Result<Vec<i64>, redis::RedisError> = pipe.query_async(&mut conn).await;
        match result {
            Ok(v) => Outcome::Hit(v),
            Err(e) => {
                warn!(err = %e, "cache pipelined SCARD batch failed, degrading");
                Outcome::Degraded
            }
        }
    }

    /// Pipelined pair of set removals, used by the Proxy-Detection Gate
    /// (spec §4.8): removes `student_id` from `joined_key` and `roll_number`
    /// from `attended_key` in one round trip.
    pub async fn pipelined_remove_pair(
        &self,
        joined_key: &str,
        student_id: &str,
        attended_key: &str,
        roll_number: &str,
    ) -> Outcome<(bool, bool)> {
        let mut conn = match &self.backend {
            Backend::Redis(c) => c.clone(),
            Backend::Memory(m) => {
                let Ok(mut store) = m.lock() else { return Outcome::Degraded };
                let a = store.sets.get_mut(joined_key).is_some_and(|s| s.remove(student_id));
                let b = store.sets.get_mut(attended_key).is_some_and(|s| s.remove(roll_number));
                return Outcome::Hit((a, b));
            }
            Backend::Disabled => return Outcome::Degraded,
        };
        let mut pipe = redis::pipe();
        pipe.cmd("SREM").arg(joined_key).arg(student_id);
        pipe.cmd("SREM").arg(attended_key).arg(roll_number);
        let result: Result<(i64, i64), redis::RedisError> = pipe.query_async(&mut conn).await;
        match result {
            Ok((a, b)) => Outcome::Hit((a > 0, b > 0)),
            Err(e) => {
                warn!(err = %e, "cache pipelined remove pair failed, degrading");
                Outcome::Degraded
            }
        }
    }
}
