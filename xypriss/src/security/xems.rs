//! XEMS, the encrypted in-memory session store.
//!
//! Sessions live in sandboxes (namespaces) and are addressed by opaque
//! tokens: 24 bytes of CSPRNG output, base64url-formatted. Payloads are
//! sealed with AES-256-GCM under the 32-byte boot secret; a missing or
//! malformed secret is a fatal boot error, and no operation runs without
//! one.
//!
//! ## Rotation
//!
//! With rotation enabled, every resolve mints a fresh token: the record
//! moves under the new token *before* the old one is retired, and the old
//! token stays resolvable for the grace period (returning the **same**
//! replacement token and data) to cover racing in-flight requests. After
//! grace, the old token is gone.
//!
//! ## Retention
//!
//! TTL expiry aside, every record is purged once it is older than the
//! absolute retention cap (default 5 days). A background sweep enforces
//! both.
//!
//! XEMS is in-process per worker; cross-worker correctness relies on the
//! load balancer's ip-hash stickiness (see the operator notes in
//! DESIGN.md) or an external sidecar implementing this same contract.

use crate::config::{decode_secret, XemsSection};
use crate::error::XyPrissError;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_BYTES: usize = 24;

struct SessionRecord {
    sandbox: String,
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
    created_at: Instant,
    expires_at: Instant,
    rotation_counter: u64,
}

struct RotatedAlias {
    replacement: String,
    sandbox: String,
    valid_until: Instant,
}

/// Options for one resolve call.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Sandbox the caller expects; a mismatch resolves to nothing
    pub sandbox: String,
    /// Mint a replacement token on this resolve
    pub rotate: bool,
    /// Refresh the TTL to this value; `None` keeps the remaining TTL
    pub ttl: Option<Duration>,
    /// How long the old token stays resolvable after rotation
    pub grace_period: Duration,
}

/// A successful resolve.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub data: serde_json::Value,
    /// Present when this resolve (or a racing one) rotated the token
    pub new_token: Option<String>,
}

/// The store. Cheap to share; all maps are concurrent.
pub struct XemsStore {
    cipher: Aes256Gcm,
    sessions: DashMap<String, SessionRecord>,
    aliases: DashMap<String, RotatedAlias>,
    config: XemsSection,
}

impl XemsStore {
    /// Build the store, decoding and validating the boot secret.
    /// Fails loudly without a usable 32-byte secret.
    pub fn new(config: XemsSection) -> Result<Self, XyPrissError> {
        let secret = config
            .secret
            .as_deref()
            .ok_or_else(|| XyPrissError::Session {
                message: "xems requires a 32-byte secret at boot".to_string(),
            })?;
        let key_bytes = decode_secret(secret).map_err(|e| XyPrissError::Session {
            message: format!("invalid xems secret: {e}"),
        })?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            sessions: DashMap::new(),
            aliases: DashMap::new(),
            config,
        })
    }

    /// Create a session in `sandbox`; returns the fresh token.
    pub fn create_session(
        &self,
        sandbox: &str,
        data: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<String, XyPrissError> {
        let token = mint_token();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let record = self.seal(sandbox, data, ttl, 0)?;
        self.sessions.insert(token.clone(), record);
        tracing::debug!(sandbox, "session created");
        Ok(token)
    }

    /// Resolve a token.
    ///
    /// Returns `None` for unknown tokens, expired or over-retention
    /// records, and (unconditionally) sandbox mismatches.
    pub fn resolve_session(
        &self,
        token: &str,
        options: &ResolveOptions,
    ) -> Result<Option<ResolvedSession>, XyPrissError> {
        // A racing (or earlier) rotation may already have retired this
        // token; the alias answers with the same replacement either way.
        if let Some(alias) = self.aliases.get(token) {
            if alias.valid_until < Instant::now() || alias.sandbox != options.sandbox {
                return Ok(None);
            }
            let replacement = alias.replacement.clone();
            drop(alias);
            let Some(record) = self.sessions.get(&replacement) else {
                return Ok(None);
            };
            let data = self.open(&record)?;
            return Ok(Some(ResolvedSession {
                data,
                new_token: Some(replacement),
            }));
        }

        let now = Instant::now();
        {
            let Some(record) = self.sessions.get(token) else {
                return Ok(None);
            };
            if record.sandbox != options.sandbox {
                tracing::warn!("session resolve with mismatched sandbox");
                return Ok(None);
            }
            if record.expires_at < now || self.over_retention(&record, now) {
                drop(record);
                self.sessions.remove(token);
                return Ok(None);
            }
        }

        if !options.rotate {
            let record = self.sessions.get(token).ok_or_else(stale_race)?;
            let data = self.open(&record)?;
            return Ok(Some(ResolvedSession {
                data,
                new_token: None,
            }));
        }

        // Rotation: the winner of the remove gets to mint; a loser falls
        // back onto the alias path above via retry.
        let Some((_, record)) = self.sessions.remove(token) else {
            return self.resolve_session(token, options);
        };
        let data = self.open(&record)?;
        let ttl = options
            .ttl
            .unwrap_or_else(|| record.expires_at.saturating_duration_since(now));
        let new_token = mint_token();
        let new_record = self.seal(
            &record.sandbox,
            &data,
            ttl,
            record.rotation_counter + 1,
        )?;
        // New token becomes valid before the old token is retired.
        self.sessions.insert(new_token.clone(), new_record);
        self.aliases.insert(
            token.to_string(),
            RotatedAlias {
                replacement: new_token.clone(),
                sandbox: record.sandbox.clone(),
                valid_until: now + options.grace_period,
            },
        );
        Ok(Some(ResolvedSession {
            data,
            new_token: Some(new_token),
        }))
    }

    /// Invalidate a token immediately, alias included.
    pub fn destroy_session(&self, token: &str) {
        if let Some((_, alias)) = self.aliases.remove(token) {
            self.sessions.remove(&alias.replacement);
        }
        self.sessions.remove(token);
    }

    /// Liveness probe.
    pub fn ping(&self) -> bool {
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop expired sessions, over-retention records, and dead aliases.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| record.expires_at >= now && !self.over_retention(record, now));
        self.aliases.retain(|_, alias| alias.valid_until >= now);
        before - self.sessions.len()
    }

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.cleanup_interval.max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = store.sweep();
                if purged > 0 {
                    tracing::debug!(purged, "xems sweep purged sessions");
                }
            }
        })
    }

    /// Resolve options derived from this store's configuration.
    pub fn default_options(&self, sandbox: &str) -> ResolveOptions {
        ResolveOptions {
            sandbox: sandbox.to_string(),
            rotate: self.config.auto_rotation,
            ttl: None,
            grace_period: self.config.grace_period,
        }
    }

    pub fn config(&self) -> &XemsSection {
        &self.config
    }

    fn over_retention(&self, record: &SessionRecord, now: Instant) -> bool {
        now.duration_since(record.created_at) > self.config.max_retention
    }

    fn seal(
        &self,
        sandbox: &str,
        data: &serde_json::Value,
        ttl: Duration,
        rotation_counter: u64,
    ) -> Result<SessionRecord, XyPrissError> {
        let plaintext = serde_json::to_vec(data)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext =
            self.cipher
                .encrypt(&nonce, plaintext.as_slice())
                .map_err(|_| XyPrissError::Session {
                    message: "payload encryption failed".to_string(),
                })?;
        let now = Instant::now();
        Ok(SessionRecord {
            sandbox: sandbox.to_string(),
            nonce: nonce.into(),
            ciphertext,
            created_at: now,
            expires_at: now + ttl,
            rotation_counter,
        })
    }

    fn open(&self, record: &SessionRecord) -> Result<serde_json::Value, XyPrissError> {
        let nonce = Nonce::from_slice(&record.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, record.ciphertext.as_slice())
            .map_err(|_| XyPrissError::Session {
                message: "payload decryption failed".to_string(),
            })?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

fn stale_race() -> XyPrissError {
    XyPrissError::Session {
        message: "session vanished mid-resolve".to_string(),
    }
}

/// 24 bytes of CSPRNG output, base64url without padding.
fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> XemsStore {
        store_with(|_| {})
    }

    fn store_with(mutate: impl FnOnce(&mut XemsSection)) -> XemsStore {
        let mut config = XemsSection {
            enabled: true,
            secret: Some("ab".repeat(32)),
            grace_period: Duration::from_millis(200),
            cleanup_interval: Duration::from_millis(100),
            ..Default::default()
        };
        mutate(&mut config);
        XemsStore::new(config).unwrap()
    }

    fn options(store: &XemsStore, sandbox: &str, rotate: bool) -> ResolveOptions {
        ResolveOptions {
            sandbox: sandbox.to_string(),
            rotate,
            ttl: None,
            grace_period: store.config().grace_period,
        }
    }

    #[test]
    fn missing_secret_fails_loudly() {
        let config = XemsSection {
            enabled: true,
            ..Default::default()
        };
        assert!(XemsStore::new(config).is_err());
    }

    #[test]
    fn create_and_resolve_round_trips_encrypted_payloads() {
        let store = store();
        let token = store
            .create_session("web", &json!({"user": "u1"}), None)
            .unwrap();
        assert!(token.len() >= 24);

        let resolved = store
            .resolve_session(&token, &options(&store, "web", false))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.data, json!({"user": "u1"}));
        assert!(resolved.new_token.is_none());
    }

    #[test]
    fn sandbox_isolation_is_absolute() {
        let store = store();
        let token = store
            .create_session("sandbox-a", &json!({"user": "u1"}), None)
            .unwrap();
        assert!(store
            .resolve_session(&token, &options(&store, "sandbox-b", false))
            .unwrap()
            .is_none());
        // The record itself is untouched by the failed cross-sandbox read.
        assert!(store
            .resolve_session(&token, &options(&store, "sandbox-a", false))
            .unwrap()
            .is_some());
    }

    #[test]
    fn rotation_mints_once_and_grace_returns_the_same_replacement() {
        let store = store();
        let t0 = store
            .create_session("web", &json!({"user": "u1"}), None)
            .unwrap();

        let first = store
            .resolve_session(&t0, &options(&store, "web", true))
            .unwrap()
            .unwrap();
        let t1 = first.new_token.clone().unwrap();
        assert_ne!(t0, t1);

        // Within grace the retired token answers with the SAME t1.
        let raced = store
            .resolve_session(&t0, &options(&store, "web", true))
            .unwrap()
            .unwrap();
        assert_eq!(raced.new_token.as_deref(), Some(t1.as_str()));
        assert_eq!(raced.data, json!({"user": "u1"}));

        // The replacement rotates again on its own resolve.
        let second = store
            .resolve_session(&t1, &options(&store, "web", true))
            .unwrap()
            .unwrap();
        let t2 = second.new_token.unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn old_token_dies_after_grace() {
        let store = store();
        let t0 = store
            .create_session("web", &json!({"user": "u1"}), None)
            .unwrap();
        store
            .resolve_session(&t0, &options(&store, "web", true))
            .unwrap()
            .unwrap();

        std::thread::sleep(Duration::from_millis(250));
        assert!(store
            .resolve_session(&t0, &options(&store, "web", true))
            .unwrap()
            .is_none());
    }

    #[test]
    fn destroy_invalidates_immediately() {
        let store = store();
        let token = store.create_session("web", &json!({}), None).unwrap();
        store.destroy_session(&token);
        assert!(store
            .resolve_session(&token, &options(&store, "web", false))
            .unwrap()
            .is_none());
    }

    #[test]
    fn destroying_a_rotated_token_kills_the_replacement() {
        let store = store();
        let t0 = store.create_session("web", &json!({}), None).unwrap();
        let t1 = store
            .resolve_session(&t0, &options(&store, "web", true))
            .unwrap()
            .unwrap()
            .new_token
            .unwrap();

        store.destroy_session(&t0);
        assert!(store
            .resolve_session(&t1, &options(&store, "web", false))
            .unwrap()
            .is_none());
    }

    #[test]
    fn ttl_expiry_resolves_to_nothing() {
        let store = store();
        let token = store
            .create_session("web", &json!({}), Some(Duration::from_millis(30)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(store
            .resolve_session(&token, &options(&store, "web", false))
            .unwrap()
            .is_none());
    }

    #[test]
    fn retention_cap_purges_regardless_of_ttl() {
        let store = store_with(|config| {
            config.max_retention = Duration::from_millis(40);
        });
        // TTL far beyond the retention cap.
        let token = store
            .create_session("web", &json!({}), Some(Duration::from_secs(3600)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(store.sweep(), 1);
        assert!(store
            .resolve_session(&token, &options(&store, "web", false))
            .unwrap()
            .is_none());
    }

    #[test]
    fn tokens_are_unique_and_opaque() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(mint_token()));
        }
    }
}
