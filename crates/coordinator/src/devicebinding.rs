// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device-Binding Cache (spec §4.3, component C3): lazy per-section map of
//! student → device fingerprint, backing the Shared Cache (C2).

use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::cache::SharedCache;
use crate::model::Triple;

/// External identity-store lookup the coordinator does not own (spec §1
/// Non-goals: identity management). Batch-loads a section's roster of
/// (studentId, fingerprint) pairs.
#[async_trait::async_trait]
pub trait IdentitySource: Send + Sync {
    async fn section_fingerprints(&self, triple: &Triple) -> anyhow::Result<Vec<(String, String)>>;
}

/// Section-wide hot cache, primed from [`IdentitySource`] on first miss and
/// mirrored into the Shared Cache so other workers skip the identity-store
/// round trip (spec §4.3).
pub struct DeviceBindingCache {
    source: std::sync::Arc<dyn IdentitySource>,
    section_ttl: Duration,
    /// In-process mirror of primed sections, avoiding a cache round trip on
    /// every scan once warm.
    hot: DashMap<String, String>,
}

impl DeviceBindingCache {
    pub fn new(source: std::sync::Arc<dyn IdentitySource>, section_ttl: Duration) -> Self {
        Self { source, section_ttl, hot: DashMap::new() }
    }

    /// Called when a session is created (spec §4.5 `startSession` side effect
    /// "preload C3 for triple").
    pub async fn preload(&self, cache: &SharedCache, triple: &Triple) -> anyhow::Result<()> {
        let section_key = format!("section:{}", triple.slug());
        if matches!(cache.exists(&section_key).await, crate::cache::Outcome::Hit(true)) {
            return Ok(());
        }

        let pairs = self.source.section_fingerprints(triple).await?;
        debug!(section = %triple.slug(), count = pairs.len(), "primed device-binding section map");

        let map: std::collections::HashMap<_, _> = pairs.iter().cloned().collect();
        cache.set(&section_key, &map, self.section_ttl).await;

        for (student_id, fingerprint) in &pairs {
            cache.set(&format!("device:{student_id}"), fingerprint, self.section_ttl).await;
            self.hot.insert(student_id.clone(), fingerprint.clone());
        }
        Ok(())
    }

    /// Resolves a student's bound fingerprint, falling through
    /// hot map → Shared Cache → identity-store batch load, per spec §4.3.
    pub async fn fingerprint_for(
        &self,
        cache: &SharedCache,
        triple: &Triple,
        student_id: &str,
    ) -> anyhow::Result<Option<String>> {
        if let Some(fp) = self.hot.get(student_id) {
            return Ok(Some(fp.clone()));
        }

        let key = format!("device:{student_id}");
        if let crate::cache::Outcome::Hit(fp) = cache.get::<String>(&key).await {
            self.hot.insert(student_id.to_owned(), fp.clone());
            return Ok(Some(fp));
        }

        self.preload(cache, triple).await?;
        Ok(self.hot.get(student_id).map(|v| v.clone()))
    }
}
