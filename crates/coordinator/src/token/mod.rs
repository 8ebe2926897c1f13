// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token Mint & Verifier (spec §4.1, component C1).

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ring::hmac;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TokenFailReason;
use crate::model::TokenKind;

/// The compact envelope signed into every minted token. No field beyond these
/// three is ever persisted in the token, per spec §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    kind: TokenKind,
    sid: Uuid,
    /// Millisecond epoch.
    iat: i64,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    sid: Uuid,
    kind: TokenKind,
    expiry: DateTime<Utc>,
}

/// Verified token result handed back to callers (spec §4.1 `verify`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verified {
    pub sid: Uuid,
    pub kind: TokenKind,
    pub iat: DateTime<Utc>,
}

/// Mints and verifies rotating session tokens; keeps a process-local
/// token→(sid, expiry) cache for the O(1) verify fast path (§4.1).
pub struct TokenMint {
    key: hmac::Key,
    window: Duration,
    cache: DashMap<String, CacheEntry>,
    /// Session ids invalidated by `invalidateBySession`, with the instant of
    /// invalidation. A token whose `iat` predates its sid's entry here is
    /// rejected even off the signature fast path — otherwise invalidation
    /// would only evict this process's cache entry while every worker,
    /// including this one on a cache miss, kept re-admitting the token from
    /// its signature alone (spec §4.1 "on leaving ACTIVE, token is
    /// invalidated").
    invalidated: DashMap<Uuid, DateTime<Utc>>,
}

impl TokenMint {
    pub fn new(secret: &str, window: Duration) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            window,
            cache: DashMap::new(),
            invalidated: DashMap::new(),
        }
    }

    pub fn hmac_key(&self) -> &hmac::Key {
        &self.key
    }

    /// `mint(sessionKey, issuer) -> (token, expiry)`.
    pub fn mint(&self, sid: Uuid, kind: TokenKind) -> (String, DateTime<Utc>) {
        let now = Utc::now();
        let envelope = Envelope { kind, sid, iat: now.timestamp_millis() };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(_) => Vec::new(),
        };
        let sig = hmac::sign(&self.key, &payload);

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig.as_ref()),
        );
        let expiry = now + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(7));

        self.cache.insert(token.clone(), CacheEntry { sid, kind, expiry });
        (token, expiry)
    }

    /// `verify(token) -> {ok, sid, kind, iat} | {fail, reason}`.
    pub fn verify(&self, token: &str) -> Result<Verified, TokenFailReason> {
        if let Some(entry) = self.cache.get(token) {
            if entry.expiry < Utc::now() {
                drop(entry);
                self.cache.remove(token);
                return Err(TokenFailReason::Expired);
            }
        }

        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenFailReason::NotFound)?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenFailReason::NotFound)?;
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenFailReason::NotFound)?;

        hmac::verify(&self.key, &payload, &sig).map_err(|_| TokenFailReason::InvalidSignature)?;

        let envelope: Envelope =
            serde_json::from_slice(&payload).map_err(|_| TokenFailReason::NotFound)?;

        let iat = DateTime::from_timestamp_millis(envelope.iat).ok_or(TokenFailReason::NotFound)?;

        // A session-scoped invalidation always wins over the signature fast
        // path: the token was minted and signed before its session left
        // ACTIVE, so the signature alone can never tell the two apart.
        if let Some(invalidated_at) = self.invalidated.get(&envelope.sid) {
            if iat <= *invalidated_at {
                return Err(TokenFailReason::Expired);
            }
        }

        let expiry = iat + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(7));
        if Utc::now() > expiry {
            return Err(TokenFailReason::Expired);
        }

        self.cache
            .entry(token.to_owned())
            .or_insert(CacheEntry { sid: envelope.sid, kind: envelope.kind, expiry });

        Ok(Verified { sid: envelope.sid, kind: envelope.kind, iat })
    }

    /// Checks the verified token resolves to the expected kind, converting a
    /// kind mismatch into the dedicated failure reason.
    pub fn verify_kind(&self, token: &str, expected: TokenKind) -> Result<Verified, TokenFailReason> {
        let verified = self.verify(token)?;
        if verified.kind != expected {
            return Err(TokenFailReason::WrongKind);
        }
        Ok(verified)
    }

    /// `invalidateBySession(sid)`: drop all cached tokens whose sid matches
    /// and record the invalidation instant so `verify` rejects any token
    /// minted for this sid at or before it, cache hit or not.
    pub fn invalidate_by_session(&self, sid: Uuid) {
        self.cache.retain(|_, entry| entry.sid != sid);
        self.invalidated.insert(sid, Utc::now());
    }

    /// Purges cache entries past their expiry. Run periodically by the
    /// process-wide maintenance loop (spec §5 "maintenance timers").
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.cache.retain(|_, entry| entry.expiry >= now);
        // An invalidation record is only needed while a token minted before
        // it could still be inside its signature window; past that window
        // every such token already fails the plain expiry check above.
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(7));
        self.invalidated.retain(|_, at| *at + window >= now);
    }
}

/// Spawns the token-cache sweep loop; cancellable via `shutdown`.
pub fn spawn_sweeper(mint: Arc<TokenMint>, shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => mint.sweep_expired(),
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_returns_same_sid_and_kind() {
        let mint = TokenMint::new("test-secret", Duration::from_secs(7));
        let sid = Uuid::new_v4();
        let (token, _expiry) = mint.mint(sid, TokenKind::Single);

        let verified = mint.verify(&token).expect("token should verify");
        assert_eq!(verified.sid, sid);
        assert_eq!(verified.kind, TokenKind::Single);
    }

    #[test]
    fn expired_token_is_rejected() {
        let mint = TokenMint::new("test-secret", Duration::from_millis(1));
        let sid = Uuid::new_v4();
        let (token, _) = mint.mint(sid, TokenKind::Single);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(mint.verify(&token), Err(TokenFailReason::Expired));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let mint = TokenMint::new("test-secret", Duration::from_secs(7));
        let sid = Uuid::new_v4();
        let (token, _) = mint.mint(sid, TokenKind::Group);

        assert_eq!(mint.verify_kind(&token, TokenKind::Single), Err(TokenFailReason::WrongKind));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mint = TokenMint::new("test-secret", Duration::from_secs(7));
        let sid = Uuid::new_v4();
        let (mut token, _) = mint.mint(sid, TokenKind::Single);
        token.push('x');

        assert!(mint.verify(&token).is_err());
    }

    #[test]
    fn invalidate_by_session_clears_cache_entry_and_blocks_signature_fallback() {
        let mint = TokenMint::new("test-secret", Duration::from_secs(7));
        let sid = Uuid::new_v4();
        let (token, _) = mint.mint(sid, TokenKind::Single);
        mint.invalidate_by_session(sid);

        assert!(mint.cache.is_empty());
        // Must not be re-admitted off the signature fast path once its
        // session has been invalidated.
        assert_eq!(mint.verify(&token), Err(TokenFailReason::Expired));
    }

    #[test]
    fn token_minted_after_invalidation_still_verifies() {
        let mint = TokenMint::new("test-secret", Duration::from_secs(7));
        let sid = Uuid::new_v4();
        mint.invalidate_by_session(sid);
        std::thread::sleep(Duration::from_millis(5));
        let (token, _) = mint.mint(sid, TokenKind::Single);

        let verified = mint.verify(&token).expect("freshly minted token should verify");
        assert_eq!(verified.sid, sid);
    }
}
