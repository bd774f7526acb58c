//! Identity records, join tokens and registration entries.
//!
//! The record store is the only shared mutable state in the broker. Updates
//! are compare-and-swap on a per-record `revision`, so concurrent renewals of
//! one subject cannot lose writes while unrelated subjects never contend on
//! anything wider than a map lookup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::claims::VerifiedClaims;
use crate::error::{IdentityError, IdentityResult};
use crate::subject::SubjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationMethod {
    JoinToken,
    HardwareEvidence,
}

/// Claims verified at the subject's last (re-)attestation, with the exact
/// document embedded in the certificate issued at that time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestedClaimsSnapshot {
    pub claims: VerifiedClaims,
    pub document: Vec<u8>,
    /// When the verifier accepted the evidence (Unix epoch milliseconds)
    pub verified_at: u64,
    pub audit_id: Option<String>,
}

/// Persistent record of an attested agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub subject: SubjectId,
    pub attestation_method: AttestationMethod,
    pub cert_serial: String,
    pub cert_not_after: u64,
    /// Certificate issued by the last renewal, not yet presented
    pub new_cert_serial: Option<String>,
    pub new_cert_not_after: Option<u64>,
    /// Renewal must carry fresh evidence
    pub can_reattest: bool,
    pub banned: bool,
    pub last_claims: Option<AttestedClaimsSnapshot>,
    /// Optimistic concurrency token, bumped by every successful update
    pub revision: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl IdentityRecord {
    pub fn new(
        subject: SubjectId,
        attestation_method: AttestationMethod,
        cert_serial: String,
        cert_not_after: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            subject,
            attestation_method,
            cert_serial,
            cert_not_after,
            new_cert_serial: None,
            new_cert_not_after: None,
            can_reattest: attestation_method == AttestationMethod::HardwareEvidence,
            banned: false,
            last_claims: None,
            revision: 0,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Expiry of `serial` if it is the current or pending certificate.
    pub fn expiry_of(&self, serial: &str) -> Option<u64> {
        if self.cert_serial == serial {
            return Some(self.cert_not_after);
        }
        match (&self.new_cert_serial, self.new_cert_not_after) {
            (Some(pending), Some(not_after)) if pending == serial => Some(not_after),
            _ => None,
        }
    }

    pub fn is_pending(&self, serial: &str) -> bool {
        self.new_cert_serial.as_deref() == Some(serial)
    }

    /// Make the pending certificate current.
    pub fn promote_pending(&mut self) {
        if let (Some(serial), Some(not_after)) =
            (self.new_cert_serial.take(), self.new_cert_not_after.take())
        {
            self.cert_serial = serial;
            self.cert_not_after = not_after;
        }
    }
}

/// Pre-shared single-use attestation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub token: String,
    pub expires_at: u64,
}

/// Authorizes a parent to mint a subordinate identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub entry_id: String,
    pub parent_id: SubjectId,
    pub subject: SubjectId,
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Overrides the configured workload TTL (milliseconds)
    #[serde(default)]
    pub svid_ttl_ms: Option<u64>,
}

/// Datastore seam.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn fetch_record(&self, subject: &SubjectId) -> IdentityResult<Option<IdentityRecord>>;

    /// Insert a new record. Fails with `Conflict` if the subject exists.
    async fn create_record(&self, record: IdentityRecord) -> IdentityResult<IdentityRecord>;

    /// Replace a record whose stored revision equals `record.revision`.
    /// Returns the stored record with its bumped revision.
    async fn update_record(&self, record: IdentityRecord) -> IdentityResult<IdentityRecord>;

    async fn delete_record(&self, subject: &SubjectId) -> IdentityResult<()>;

    async fn list_records(&self) -> IdentityResult<Vec<IdentityRecord>>;

    async fn create_join_token(&self, token: JoinToken) -> IdentityResult<()>;

    /// Fetch and delete in one step. A token can be taken once.
    async fn take_join_token(&self, token: &str) -> IdentityResult<Option<JoinToken>>;

    async fn put_registration_entry(&self, entry: RegistrationEntry) -> IdentityResult<()>;

    async fn fetch_registration_entry(
        &self,
        entry_id: &str,
    ) -> IdentityResult<Option<RegistrationEntry>>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    records: RwLock<HashMap<SubjectId, IdentityRecord>>,
    join_tokens: RwLock<HashMap<String, JoinToken>>,
    entries: RwLock<HashMap<String, RegistrationEntry>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> IdentityError {
    IdentityError::Datastore(format!("{what} lock poisoned"))
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn fetch_record(&self, subject: &SubjectId) -> IdentityResult<Option<IdentityRecord>> {
        let records = self.records.read().map_err(|_| poisoned("records"))?;
        Ok(records.get(subject).cloned())
    }

    async fn create_record(&self, mut record: IdentityRecord) -> IdentityResult<IdentityRecord> {
        let mut records = self.records.write().map_err(|_| poisoned("records"))?;
        if records.contains_key(&record.subject) {
            return Err(IdentityError::Conflict {
                subject: record.subject.to_string(),
            });
        }
        record.revision = 1;
        records.insert(record.subject.clone(), record.clone());
        Ok(record)
    }

    async fn update_record(&self, mut record: IdentityRecord) -> IdentityResult<IdentityRecord> {
        let mut records = self.records.write().map_err(|_| poisoned("records"))?;
        let stored = records
            .get_mut(&record.subject)
            .ok_or_else(|| IdentityError::NotFound {
                subject: record.subject.to_string(),
            })?;
        if stored.revision != record.revision {
            return Err(IdentityError::Conflict {
                subject: record.subject.to_string(),
            });
        }
        record.revision += 1;
        *stored = record.clone();
        Ok(record)
    }

    async fn delete_record(&self, subject: &SubjectId) -> IdentityResult<()> {
        let mut records = self.records.write().map_err(|_| poisoned("records"))?;
        records
            .remove(subject)
            .map(|_| ())
            .ok_or_else(|| IdentityError::NotFound {
                subject: subject.to_string(),
            })
    }

    async fn list_records(&self) -> IdentityResult<Vec<IdentityRecord>> {
        let records = self.records.read().map_err(|_| poisoned("records"))?;
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.subject.cmp(&b.subject));
        Ok(all)
    }

    async fn create_join_token(&self, token: JoinToken) -> IdentityResult<()> {
        let mut tokens = self.join_tokens.write().map_err(|_| poisoned("join tokens"))?;
        if tokens.contains_key(&token.token) {
            return Err(IdentityError::Datastore("join token already exists".to_string()));
        }
        tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn take_join_token(&self, token: &str) -> IdentityResult<Option<JoinToken>> {
        let mut tokens = self.join_tokens.write().map_err(|_| poisoned("join tokens"))?;
        Ok(tokens.remove(token))
    }

    async fn put_registration_entry(&self, entry: RegistrationEntry) -> IdentityResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("entries"))?;
        entries.insert(entry.entry_id.clone(), entry);
        Ok(())
    }

    async fn fetch_registration_entry(
        &self,
        entry_id: &str,
    ) -> IdentityResult<Option<RegistrationEntry>> {
        let entries = self.entries.read().map_err(|_| poisoned("entries"))?;
        Ok(entries.get(entry_id).cloned())
    }
}
