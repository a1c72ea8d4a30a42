//! Node bearer tokens: issuance, validation with lockout, revocation.
//!
//! Only the SHA-256 hex digest of a token is stored. Lockout is derived from
//! the failed-attempt window every time it is checked; nothing stores a
//! "locked" flag.
//!
//! Node API requests can also carry an HMAC-SHA256 signature over the body,
//! see [`sign_payload`] and [`verify_signature`].

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{SecurityEvent, SecurityEventKind, SecurityEventSink, Severity};
use crate::resources::{ResourceExhausted, ResourceGuard};
use crate::store::{FailedAttempt, NewToken, NodeId, StorageError, TokenId, TokenStore};

const TOKEN_BYTES: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),

    #[error("invalid signing key: {0}")]
    SigningKey(String),
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub token_ttl: Duration,
    pub max_failed_attempts: usize,
    pub lockout_window: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::hours(168),
            max_failed_attempts: 5,
            lockout_window: Duration::minutes(30),
        }
    }
}

/// A freshly generated token. The raw value is only available here.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub node_id: NodeId,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("node_id", &self.node_id)
            .field("expires_at", &self.expires_at)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SecuritySummary {
    pub active_tokens: usize,
    pub expired_tokens: usize,
    pub failed_attempts_24h: usize,
    pub locked_out_nodes: usize,
    /// Last successful `cleanup_expired` run by this authenticator
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Token metadata safe to show an operator. Carries neither the token nor
/// its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub id: TokenId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub is_expired: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    LockedOut,
    InvalidToken,
    ExpiredToken,
    InactiveToken,
}

impl Rejection {
    fn reason(self) -> &'static str {
        match self {
            Rejection::LockedOut => "locked out",
            Rejection::InvalidToken => "invalid token",
            Rejection::ExpiredToken => "expired token",
            Rejection::InactiveToken => "inactive token",
        }
    }
}

/// SHA-256 hex digest of a raw token.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Hex HMAC-SHA256 of `payload` keyed with `secret`.
pub fn sign_payload(payload: &str, secret: &str) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::SigningKey(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a hex signature from [`sign_payload`]. The digest comparison is
/// constant-time; malformed hex is simply a mismatch.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn generate_raw_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

pub struct TokenAuthenticator {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn SecurityEventSink>,
    resources: Arc<dyn ResourceGuard>,
    settings: AuthSettings,
    // Serializes the lockout check and the attempt bookkeeping per node.
    node_locks: DashMap<NodeId, Arc<Mutex<()>>>,
    last_cleanup: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl TokenAuthenticator {
    pub fn new(
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn SecurityEventSink>,
        resources: Arc<dyn ResourceGuard>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            resources,
            settings,
            node_locks: DashMap::new(),
            last_cleanup: parking_lot::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    fn node_lock(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        self.node_locks.entry(node_id).or_default().clone()
    }

    /// Issue a token for `node_id`. The raw value is returned once and never
    /// persisted.
    pub async fn generate_token(&self, node_id: NodeId) -> Result<IssuedToken, AuthError> {
        self.resources.ensure_capacity()?;

        let token = generate_raw_token();
        let now = self.clock.now();
        let expires_at = now + self.settings.token_ttl;
        let record = self
            .store
            .store_token(NewToken {
                node_id,
                token_hash: hash_token(&token),
                created_at: now,
                expires_at,
            })
            .await?;

        info!(node_id, token_id = record.id, %expires_at, "Issued node token");
        self.events.emit(
            SecurityEvent::new(
                SecurityEventKind::TokenIssued,
                Severity::Info,
                format!("token {} expires {}", record.id, expires_at),
            )
            .for_node(node_id),
        );

        Ok(IssuedToken {
            token,
            node_id,
            expires_at,
        })
    }

    /// Whether `token` authenticates `node_id`. Every failure, including
    /// storage trouble, is a plain `false`.
    pub async fn validate_token(&self, token: &str, node_id: NodeId) -> bool {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;

        match self.check(token, node_id).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(node_id, error = %e, "Token validation failed on storage error");
                false
            }
        }
    }

    async fn check(&self, token: &str, node_id: NodeId) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let window_start = now - self.settings.lockout_window;
        let failures = self
            .store
            .count_failed_attempts(node_id, window_start)
            .await?;

        if failures >= self.settings.max_failed_attempts {
            self.reject(node_id, now, failures, Rejection::LockedOut)
                .await?;
            return Ok(false);
        }

        let Some(record) = self.store.find_token(node_id, &hash_token(token)).await? else {
            self.reject(node_id, now, failures, Rejection::InvalidToken)
                .await?;
            return Ok(false);
        };

        if record.is_expired_at(now) {
            self.store.deactivate_token(record.id).await?;
            self.reject(node_id, now, failures, Rejection::ExpiredToken)
                .await?;
            return Ok(false);
        }

        if !record.is_active {
            self.reject(node_id, now, failures, Rejection::InactiveToken)
                .await?;
            return Ok(false);
        }

        self.store.record_token_use(record.id, now).await?;
        self.store.clear_failed_attempts(node_id).await?;

        debug!(node_id, token_id = record.id, "Node token accepted");
        self.events.emit(
            SecurityEvent::new(
                SecurityEventKind::AuthSuccess,
                Severity::Info,
                format!("token {}", record.id),
            )
            .for_node(node_id),
        );
        Ok(true)
    }

    async fn reject(
        &self,
        node_id: NodeId,
        now: DateTime<Utc>,
        prior_failures: usize,
        rejection: Rejection,
    ) -> Result<(), StorageError> {
        let reason = rejection.reason();
        self.store
            .record_failed_attempt(FailedAttempt {
                node_id,
                attempted_at: now,
                reason: reason.to_string(),
            })
            .await?;

        warn!(node_id, reason, "Node token rejected");
        self.events.emit(
            SecurityEvent::new(SecurityEventKind::AuthFailure, Severity::Warning, reason)
                .for_node(node_id),
        );

        if rejection != Rejection::LockedOut
            && prior_failures + 1 == self.settings.max_failed_attempts
        {
            warn!(
                node_id,
                attempts = self.settings.max_failed_attempts,
                window_mins = self.settings.lockout_window.num_minutes(),
                "Node locked out"
            );
            self.events.emit(
                SecurityEvent::new(
                    SecurityEventKind::LockoutEngaged,
                    Severity::Critical,
                    format!(
                        "{} failed attempts within {} minutes",
                        self.settings.max_failed_attempts,
                        self.settings.lockout_window.num_minutes()
                    ),
                )
                .for_node(node_id),
            );
        }
        Ok(())
    }

    /// Deactivate one token. Returns whether anything changed.
    pub async fn revoke_token(&self, node_id: NodeId, token: &str) -> Result<bool, AuthError> {
        let Some(record) = self.store.find_token(node_id, &hash_token(token)).await? else {
            return Ok(false);
        };
        let changed = self.store.deactivate_token(record.id).await?;
        if changed {
            info!(node_id, token_id = record.id, "Revoked node token");
            self.events.emit(
                SecurityEvent::new(
                    SecurityEventKind::TokenRevoked,
                    Severity::Info,
                    format!("token {}", record.id),
                )
                .for_node(node_id),
            );
        }
        Ok(changed)
    }

    /// Deactivate every token of a node. Returns whether anything changed.
    pub async fn revoke_all_tokens(&self, node_id: NodeId) -> Result<bool, AuthError> {
        let revoked = self.store.deactivate_all_tokens(node_id).await?;
        if revoked > 0 {
            info!(node_id, revoked, "Revoked all node tokens");
            self.events.emit(
                SecurityEvent::new(
                    SecurityEventKind::TokenRevoked,
                    Severity::Info,
                    format!("{} tokens", revoked),
                )
                .for_node(node_id),
            );
        }
        Ok(revoked > 0)
    }

    pub async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        let now = self.clock.now();
        let removed = self.store.purge_expired_tokens(now).await?;
        *self.last_cleanup.lock() = Some(now);
        if removed > 0 {
            info!(removed, "Purged expired node tokens");
        }
        Ok(removed)
    }

    pub async fn security_summary(&self) -> Result<SecuritySummary, AuthError> {
        let now = self.clock.now();
        let counts = self.store.token_counts(now).await?;
        let recent = self
            .store
            .failed_attempts_since(now - Duration::hours(24))
            .await?;

        let window_start = now - self.settings.lockout_window;
        let mut per_node: HashMap<NodeId, usize> = HashMap::new();
        for attempt in recent.iter().filter(|a| a.attempted_at >= window_start) {
            *per_node.entry(attempt.node_id).or_default() += 1;
        }
        let locked_out_nodes = per_node
            .values()
            .filter(|&&n| n >= self.settings.max_failed_attempts)
            .count();

        Ok(SecuritySummary {
            active_tokens: counts.active,
            expired_tokens: counts.expired,
            failed_attempts_24h: recent.len(),
            locked_out_nodes,
            last_cleanup: *self.last_cleanup.lock(),
        })
    }

    pub async fn token_info(&self, node_id: NodeId) -> Result<Vec<TokenInfo>, AuthError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_tokens(node_id)
            .await?
            .into_iter()
            .map(|t| TokenInfo {
                id: t.id,
                created_at: t.created_at,
                expires_at: t.expires_at,
                is_active: t.is_active,
                is_expired: t.is_expired_at(now),
                last_used_at: t.last_used_at,
                usage_count: t.usage_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::RecordingSink;
    use crate::resources::Unlimited;
    use crate::store::MemoryStore;

    struct Harness {
        auth: Arc<TokenAuthenticator>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        events: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = Arc::new(RecordingSink::default());
        let auth = Arc::new(TokenAuthenticator::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            Arc::new(Unlimited),
            AuthSettings::default(),
        ));
        Harness {
            auth,
            store,
            clock,
            events,
        }
    }

    struct DiskFull;

    impl ResourceGuard for DiskFull {
        fn ensure_capacity(&self) -> Result<(), ResourceExhausted> {
            Err(ResourceExhausted {
                path: "/".to_string(),
                used_percent: 99.0,
                free_gb: 0.1,
            })
        }
    }

    #[tokio::test]
    async fn generated_token_is_url_safe_and_only_its_hash_is_stored() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();

        assert_eq!(issued.token.len(), 43);
        assert!(issued
            .token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let stored = h.store.list_tokens(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].token_hash, issued.token);
        assert_eq!(stored[0].token_hash, hash_token(&issued.token));
        assert_eq!(stored[0].expires_at - stored[0].created_at, Duration::hours(168));
        assert!(!format!("{:?}", issued).contains(&issued.token));
    }

    #[tokio::test]
    async fn valid_token_is_accepted_and_usage_is_recorded() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();

        assert!(h.auth.validate_token(&issued.token, 1).await);
        assert!(h.auth.validate_token(&issued.token, 1).await);

        let info = h.auth.token_info(1).await.unwrap();
        assert_eq!(info[0].usage_count, 2);
        assert_eq!(info[0].last_used_at, Some(h.clock.now()));
        assert_eq!(h.events.count(SecurityEventKind::AuthSuccess), 2);
    }

    #[tokio::test]
    async fn token_for_another_node_is_rejected() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();
        assert!(!h.auth.validate_token(&issued.token, 2).await);
        assert_eq!(
            h.store.count_failed_attempts(2, h.clock.now()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn token_expires_exactly_at_its_expiry_instant() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();

        h.clock.set(issued.expires_at - Duration::seconds(1));
        assert!(h.auth.validate_token(&issued.token, 1).await);

        h.clock.set(issued.expires_at);
        assert!(!h.auth.validate_token(&issued.token, 1).await);

        let info = h.auth.token_info(1).await.unwrap();
        assert!(!info[0].is_active);
        assert!(info[0].is_expired);
    }

    #[tokio::test]
    async fn revoked_token_is_inactive_and_revocation_is_idempotent() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();

        assert!(h.auth.revoke_token(1, &issued.token).await.unwrap());
        assert!(!h.auth.revoke_token(1, &issued.token).await.unwrap());
        assert!(!h.auth.validate_token(&issued.token, 1).await);
        assert_eq!(h.events.count(SecurityEventKind::TokenRevoked), 1);

        let attempts = h
            .store
            .failed_attempts_since(h.clock.now() - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(attempts[0].reason, "inactive token");
    }

    #[tokio::test]
    async fn revoke_all_reports_whether_anything_changed() {
        let h = harness();
        let a = h.auth.generate_token(3).await.unwrap();
        let b = h.auth.generate_token(3).await.unwrap();

        assert!(h.auth.revoke_all_tokens(3).await.unwrap());
        assert!(!h.auth.revoke_all_tokens(3).await.unwrap());
        assert!(!h.auth.validate_token(&a.token, 3).await);
        assert!(!h.auth.validate_token(&b.token, 3).await);
    }

    #[tokio::test]
    async fn success_clears_failed_attempts_below_threshold() {
        let h = harness();
        let issued = h.auth.generate_token(1).await.unwrap();
        for _ in 0..3 {
            assert!(!h.auth.validate_token("wrong", 1).await);
        }
        assert!(h.auth.validate_token(&issued.token, 1).await);
        assert_eq!(
            h.store
                .count_failed_attempts(1, h.clock.now() - Duration::hours(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn story_lockout_blocks_valid_token_until_window_ages_out() {
        let h = harness();
        let issued = h.auth.generate_token(7).await.unwrap();

        for _ in 0..5 {
            assert!(!h.auth.validate_token("guess", 7).await);
        }
        assert_eq!(h.events.count(SecurityEventKind::LockoutEngaged), 1);

        // Sixth attempt, with the real token, is still refused.
        assert!(!h.auth.validate_token(&issued.token, 7).await);
        let attempts = h
            .store
            .failed_attempts_since(h.clock.now())
            .await
            .unwrap();
        assert_eq!(attempts.last().unwrap().reason, "locked out");
        assert_eq!(h.auth.security_summary().await.unwrap().locked_out_nodes, 1);

        h.clock.advance(Duration::minutes(29));
        assert!(!h.auth.validate_token(&issued.token, 7).await);

        // Let every recorded failure age past the window.
        h.clock.advance(Duration::minutes(31));
        assert!(h.auth.validate_token(&issued.token, 7).await);
        assert_eq!(h.auth.security_summary().await.unwrap().locked_out_nodes, 0);
    }

    #[tokio::test]
    async fn lockout_is_scoped_to_one_node() {
        let h = harness();
        let other = h.auth.generate_token(2).await.unwrap();
        for _ in 0..5 {
            h.auth.validate_token("guess", 1).await;
        }
        assert!(h.auth.validate_token(&other.token, 2).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_engage_lockout_exactly_once() {
        let h = harness();
        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let auth = h.auth.clone();
                tokio::spawn(async move { auth.validate_token("guess", 5).await })
            })
            .collect();
        for task in tasks {
            assert!(!task.await.unwrap());
        }

        assert_eq!(h.events.count(SecurityEventKind::LockoutEngaged), 1);
        let reasons: Vec<String> = h
            .store
            .failed_attempts_since(h.clock.now())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.reason)
            .collect();
        assert_eq!(reasons.iter().filter(|r| *r == "invalid token").count(), 5);
        assert_eq!(reasons.iter().filter(|r| *r == "locked out").count(), 7);
    }

    #[tokio::test]
    async fn cleanup_and_summary_count_expired_tokens() {
        let h = harness();
        h.auth.generate_token(1).await.unwrap();
        h.clock.advance(Duration::hours(100));
        h.auth.generate_token(2).await.unwrap();
        h.clock.advance(Duration::hours(100));
        h.auth.validate_token("guess", 2).await;

        let summary = h.auth.security_summary().await.unwrap();
        assert_eq!(summary.active_tokens, 1);
        assert_eq!(summary.expired_tokens, 1);
        assert_eq!(summary.failed_attempts_24h, 1);
        assert_eq!(summary.locked_out_nodes, 0);
        assert_eq!(summary.last_cleanup, None);

        assert_eq!(h.auth.cleanup_expired().await.unwrap(), 1);
        let summary = h.auth.security_summary().await.unwrap();
        assert_eq!(summary.expired_tokens, 0);
        assert_eq!(summary.last_cleanup, Some(h.clock.now()));
    }

    #[test]
    fn signature_matches_rfc4231_vector() {
        let sig = sign_payload("what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signature_verifies_for_original_payload_and_secret() {
        let body = r#"{"node_id":7,"usage":4096}"#;
        let sig = sign_payload(body, "node-secret").unwrap();
        assert!(verify_signature(body, &sig, "node-secret"));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let sig = sign_payload(r#"{"node_id":7,"usage":4096}"#, "node-secret").unwrap();
        assert!(!verify_signature(r#"{"node_id":7,"usage":0}"#, &sig, "node-secret"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = r#"{"node_id":7}"#;
        let sig = sign_payload(body, "node-secret").unwrap();
        assert!(!verify_signature(body, &sig, "other-secret"));
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let body = r#"{"node_id":7}"#;
        assert!(!verify_signature(body, "not-hex", "node-secret"));
        let sig = sign_payload(body, "node-secret").unwrap();
        assert!(!verify_signature(body, &sig[..32], "node-secret"));
    }

    #[tokio::test]
    async fn token_issuance_fails_fast_when_disk_is_full() {
        let store = Arc::new(MemoryStore::new());
        let auth = TokenAuthenticator::new(
            store.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(RecordingSink::default()),
            Arc::new(DiskFull),
            AuthSettings::default(),
        );
        let err = auth.generate_token(1).await.unwrap_err();
        assert!(matches!(err, AuthError::ResourceExhausted(_)));
        assert!(store.list_tokens(1).await.unwrap().is_empty());
    }
}
