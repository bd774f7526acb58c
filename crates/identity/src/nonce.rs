//! Freshness nonce manager.
//!
//! Nonces are 256-bit random challenges bound to one pending attempt. A nonce
//! is accepted at most once: consumption happens under the table lock, so two
//! concurrent submissions of the same nonce produce exactly one winner.
//! Consumed nonces stay behind as tombstones until their window closes so a
//! replay is reported as [`FreshnessViolation::Reused`].

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use sovereign_core::{now_ms, NonceConfig};

use crate::error::{FreshnessViolation, IdentityError, IdentityResult};
use crate::subject::SubjectId;

/// Nonce size in bytes.
pub const NONCE_LEN: usize = 32;

/// Default nonce lifetime (milliseconds).
pub const DEFAULT_NONCE_TTL_MS: u64 = 60_000;

/// Default cap on tracked nonces, pending and consumed.
pub const DEFAULT_MAX_PENDING_NONCES: usize = 10_000;

/// What a nonce was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceScope {
    /// First-time attestation; the subject is not known yet
    Attestation,
    /// Renewal of an existing subject
    Subject(SubjectId),
}

/// A nonce handed to a subject, with its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Hex-encoded nonce
    pub nonce: String,
    /// Expiry (Unix epoch milliseconds)
    pub expires_at: u64,
}

#[derive(Debug)]
struct NonceEntry {
    scope: NonceScope,
    expires_at: u64,
    consumed: bool,
}

/// Issues and consumes single-use freshness nonces.
#[derive(Debug)]
pub struct NonceManager {
    ttl_ms: u64,
    max_pending: usize,
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: ttl.as_millis() as u64,
            max_pending: DEFAULT_MAX_PENDING_NONCES,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn from_config(config: &NonceConfig) -> Self {
        Self::new(config.ttl()).with_max_pending(config.max_pending)
    }

    /// Issue a fresh nonce for `scope`.
    pub fn issue(&self, scope: NonceScope) -> IdentityResult<Challenge> {
        self.issue_at(scope, now_ms())
    }

    pub fn issue_at(&self, scope: NonceScope, now: u64) -> IdentityResult<Challenge> {
        let mut entries = self.lock()?;
        purge(&mut entries, now);

        if entries.len() >= self.max_pending {
            return Err(IdentityError::ResourceExhausted(format!(
                "{} nonces outstanding",
                entries.len()
            )));
        }

        let nonce = loop {
            let candidate = generate_nonce();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let expires_at = now.saturating_add(self.ttl_ms);
        entries.insert(
            nonce.clone(),
            NonceEntry {
                scope,
                expires_at,
                consumed: false,
            },
        );

        Ok(Challenge { nonce, expires_at })
    }

    /// Consume `nonce` for `expected` scope. Succeeds at most once per nonce.
    pub fn consume(&self, nonce: &str, expected: &NonceScope) -> IdentityResult<()> {
        self.consume_at(nonce, expected, now_ms())
    }

    pub fn consume_at(&self, nonce: &str, expected: &NonceScope, now: u64) -> IdentityResult<()> {
        if nonce.is_empty() {
            return Err(IdentityError::FreshnessViolation(FreshnessViolation::Missing));
        }

        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(nonce)
            .ok_or(IdentityError::FreshnessViolation(FreshnessViolation::Unknown))?;

        if entry.consumed {
            return Err(IdentityError::FreshnessViolation(FreshnessViolation::Reused));
        }
        // Any presentation burns the nonce, including failed ones.
        entry.consumed = true;

        if now > entry.expires_at {
            return Err(IdentityError::FreshnessViolation(FreshnessViolation::Expired));
        }
        if entry.scope != *expected {
            return Err(IdentityError::FreshnessViolation(
                FreshnessViolation::ScopeMismatch,
            ));
        }
        Ok(())
    }

    /// Whether `nonce` is issued, unconsumed and unexpired.
    pub fn is_pending(&self, nonce: &str) -> bool {
        let now = now_ms();
        self.lock()
            .map(|entries| {
                entries
                    .get(nonce)
                    .is_some_and(|e| !e.consumed && now <= e.expires_at)
            })
            .unwrap_or(false)
    }

    /// Drop expired nonces and tombstones. Returns how many were removed.
    pub fn purge_expired(&self) -> IdentityResult<usize> {
        self.purge_expired_at(now_ms())
    }

    pub fn purge_expired_at(&self, now: u64) -> IdentityResult<usize> {
        let mut entries = self.lock()?;
        Ok(purge(&mut entries, now))
    }

    /// Number of tracked nonces, including unexpired tombstones.
    pub fn tracked(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    fn lock(&self) -> IdentityResult<std::sync::MutexGuard<'_, HashMap<String, NonceEntry>>> {
        self.entries
            .lock()
            .map_err(|_| IdentityError::InvalidState("nonce table lock poisoned".to_string()))
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_NONCE_TTL_MS))
    }
}

/// Short digest of a nonce for logs and audit records.
pub fn nonce_digest(nonce: &str) -> String {
    let hash = blake3::hash(nonce.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}

fn purge(entries: &mut HashMap<String, NonceEntry>, now: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| now <= entry.expires_at);
    before - entries.len()
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn subject(path: &str) -> SubjectId {
        SubjectId::parse(&format!("spiffe://example.org{path}")).unwrap()
    }

    #[test]
    fn test_nonce_is_256_bits_hex() {
        let manager = NonceManager::default();
        let challenge = manager.issue(NonceScope::Attestation).unwrap();
        assert_eq!(challenge.nonce.len(), NONCE_LEN * 2);
        assert!(hex::decode(&challenge.nonce).is_ok());
        assert!(manager.is_pending(&challenge.nonce));
    }

    #[test]
    fn test_nonces_do_not_collide() {
        let manager = NonceManager::default();
        let issued: HashSet<String> = (0..500)
            .map(|_| manager.issue(NonceScope::Attestation).unwrap().nonce)
            .collect();
        assert_eq!(issued.len(), 500);
    }

    #[test]
    fn test_consume_once_then_reused() {
        let manager = NonceManager::default();
        let challenge = manager.issue(NonceScope::Attestation).unwrap();

        manager
            .consume(&challenge.nonce, &NonceScope::Attestation)
            .unwrap();
        let err = manager
            .consume(&challenge.nonce, &NonceScope::Attestation)
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::FreshnessViolation(FreshnessViolation::Reused)
        ));
        assert!(!manager.is_pending(&challenge.nonce));
    }

    #[test]
    fn test_missing_and_unknown() {
        let manager = NonceManager::default();
        assert!(matches!(
            manager.consume("", &NonceScope::Attestation),
            Err(IdentityError::FreshnessViolation(FreshnessViolation::Missing))
        ));
        assert!(matches!(
            manager.consume("deadbeef", &NonceScope::Attestation),
            Err(IdentityError::FreshnessViolation(FreshnessViolation::Unknown))
        ));
    }

    #[test]
    fn test_expired_nonce_is_rejected_and_burned() {
        let manager = NonceManager::new(Duration::from_millis(1_000));
        let challenge = manager.issue_at(NonceScope::Attestation, 10_000).unwrap();
        assert_eq!(challenge.expires_at, 11_000);

        let err = manager
            .consume_at(&challenge.nonce, &NonceScope::Attestation, 11_001)
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::FreshnessViolation(FreshnessViolation::Expired)
        ));
        assert!(manager
            .consume_at(&challenge.nonce, &NonceScope::Attestation, 10_500)
            .is_err());
    }

    #[test]
    fn test_scope_mismatch_burns_nonce() {
        let manager = NonceManager::default();
        let alice = subject("/agent/alice");
        let mallory = subject("/agent/mallory");
        let challenge = manager.issue(NonceScope::Subject(alice.clone())).unwrap();

        assert!(matches!(
            manager.consume(&challenge.nonce, &NonceScope::Subject(mallory)),
            Err(IdentityError::FreshnessViolation(
                FreshnessViolation::ScopeMismatch
            ))
        ));
        assert!(manager
            .consume(&challenge.nonce, &NonceScope::Subject(alice))
            .is_err());
    }

    #[test]
    fn test_max_pending_bound() {
        let manager = NonceManager::default().with_max_pending(2);
        manager.issue(NonceScope::Attestation).unwrap();
        manager.issue(NonceScope::Attestation).unwrap();
        assert!(matches!(
            manager.issue(NonceScope::Attestation),
            Err(IdentityError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_purge_frees_capacity() {
        let manager = NonceManager::new(Duration::from_millis(100)).with_max_pending(1);
        manager.issue_at(NonceScope::Attestation, 1_000).unwrap();
        assert_eq!(manager.purge_expired_at(1_050).unwrap(), 0);
        assert_eq!(manager.purge_expired_at(1_101).unwrap(), 1);
        manager.issue_at(NonceScope::Attestation, 1_200).unwrap();
        assert_eq!(manager.tracked(), 1);
    }

    #[test]
    fn test_concurrent_consume_has_one_winner() {
        let manager = Arc::new(NonceManager::default());
        let challenge = manager.issue(NonceScope::Attestation).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let nonce = challenge.nonce.clone();
                std::thread::spawn(move || manager.consume(&nonce, &NonceScope::Attestation).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_digest_is_stable_and_short() {
        assert_eq!(nonce_digest("abc"), nonce_digest("abc"));
        assert_eq!(nonce_digest("abc").len(), 16);
        assert_ne!(nonce_digest("abc"), nonce_digest("abd"));
    }
}
