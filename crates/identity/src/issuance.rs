//! Subordinate identity issuance.
//!
//! An attested agent presents its own identity certificate and receives a
//! workload identity that inherits its verified claims. No evidence is
//! verified here and the service holds no verifier handle: trust flows from
//! the parent's record, its presented certificate and a registration entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use sovereign_core::{now_ms, BrokerConfig};

use crate::attestation::with_deadline;
use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::claims::{
    build_claims_document, claims_digest, ClaimsInput, ClaimsLineage, KeySource, VerifiedClaims,
    CLAIMS_EXTENSION_OID,
};
use crate::error::{IdentityError, IdentityResult};
use crate::pki::{Certificate, CertificateRequest, CertificateSigner, SvidParams};
use crate::store::{IdentityStore, RegistrationEntry};
use crate::subject::{validate_segment, SubjectId, TrustDomain};

/// The agent asking for a subordinate identity.
#[derive(Debug, Clone)]
pub struct ParentIdentity {
    /// Authenticated subject of the caller
    pub subject: SubjectId,
    /// Certificate the caller presented
    pub certificate: Certificate,
}

impl ParentIdentity {
    pub fn new(subject: SubjectId, certificate: Certificate) -> Self {
        Self {
            subject,
            certificate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubordinateRequest {
    pub entry_id: String,
    pub csr: CertificateRequest,
    pub workload_code_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubordinateIdentity {
    pub subject: SubjectId,
    /// `[subordinate, parent]`
    pub cert_chain: Vec<Certificate>,
    pub expires_at: u64,
    pub claims_document: Vec<u8>,
    pub inherited_claims: Option<VerifiedClaims>,
    pub lineage: ClaimsLineage,
}

#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub workload_svid_ttl: Duration,
    pub max_inherited_claims_age: Duration,
    pub datastore_deadline: Duration,
    pub expose_denial_details: bool,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl IssuanceSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            workload_svid_ttl: config.issuance.workload_svid_ttl(),
            max_inherited_claims_age: config.issuance.max_inherited_claims_age(),
            datastore_deadline: config.datastore.timeout(),
            expose_denial_details: config.server.expose_denial_details,
        }
    }
}

/// Workload identity service.
pub struct IdentityIssuanceService {
    trust_domain: TrustDomain,
    settings: IssuanceSettings,
    signer: Arc<dyn CertificateSigner>,
    store: Arc<dyn IdentityStore>,
    audit: Arc<dyn AuditSink>,
}

impl IdentityIssuanceService {
    pub fn new(
        trust_domain: TrustDomain,
        settings: IssuanceSettings,
        signer: Arc<dyn CertificateSigner>,
        store: Arc<dyn IdentityStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            trust_domain,
            settings,
            signer,
            store,
            audit,
        }
    }

    /// Authorize `entry.parent_id` to mint `entry.subject`.
    pub async fn register_entry(&self, entry: RegistrationEntry) -> IdentityResult<()> {
        validate_segment(&entry.entry_id)?;
        for subject in [&entry.parent_id, &entry.subject] {
            if !subject.is_member_of(&self.trust_domain) {
                return Err(IdentityError::InvalidRequest(format!(
                    "{subject} is outside trust domain {}",
                    self.trust_domain
                )));
            }
        }
        if entry.svid_ttl_ms == Some(0) {
            return Err(IdentityError::InvalidRequest(
                "registration entry TTL must be non-zero".to_string(),
            ));
        }
        if entry.subject.is_agent() {
            return Err(IdentityError::InvalidRequest(format!(
                "{} is in the reserved agent namespace",
                entry.subject
            )));
        }
        if entry.subject == entry.parent_id {
            return Err(IdentityError::InvalidRequest(
                "registration entry cannot name its own parent".to_string(),
            ));
        }
        // A workload name must never collide with an attested agent.
        if self
            .datastore(self.store.fetch_record(&entry.subject))
            .await?
            .is_some()
        {
            return Err(IdentityError::InvalidRequest(format!(
                "{} already belongs to an attested agent",
                entry.subject
            )));
        }
        debug!(entry_id = %entry.entry_id, subject = %entry.subject, "Registering entry");
        self.datastore(self.store.put_registration_entry(entry)).await
    }

    /// Mint a subordinate identity chained to `parent`.
    pub async fn issue_subordinate(
        &self,
        parent: &ParentIdentity,
        request: SubordinateRequest,
    ) -> IdentityResult<SubordinateIdentity> {
        match self.issue_inner(parent, request).await {
            Ok(issued) => {
                let serial = issued
                    .cert_chain
                    .first()
                    .map(|cert| cert.serial.clone())
                    .unwrap_or_default();
                info!(
                    subject = %issued.subject,
                    parent = %parent.subject,
                    serial = %serial,
                    "Subordinate identity issued"
                );
                self.audit.record(
                    AuditEvent::new("issue_subordinate", AuditOutcome::Issued)
                        .with_subject(&issued.subject)
                        .with_serial(serial),
                );
                Ok(issued)
            }
            Err(err) => {
                self.audit.record(
                    AuditEvent::from_error("issue_subordinate", &err).with_subject(&parent.subject),
                );
                Err(if self.settings.expose_denial_details {
                    err
                } else {
                    err.redacted()
                })
            }
        }
    }

    async fn issue_inner(
        &self,
        parent: &ParentIdentity,
        request: SubordinateRequest,
    ) -> IdentityResult<SubordinateIdentity> {
        let subject_key = request.csr.verify()?;
        let presented = &parent.certificate;
        let now = now_ms();

        let mut record = self
            .datastore(self.store.fetch_record(&parent.subject))
            .await?
            .ok_or_else(|| {
                IdentityError::ChainIntegrity(format!(
                    "parent {} has no identity record",
                    parent.subject
                ))
            })?;
        if record.banned {
            return Err(IdentityError::ChainIntegrity(format!(
                "parent {} is banned",
                parent.subject
            )));
        }
        let parent_not_after = record.expiry_of(&presented.serial).ok_or_else(|| {
            IdentityError::ChainIntegrity(format!(
                "certificate {} is not the current identity of {}",
                presented.serial, parent.subject
            ))
        })?;
        if parent_not_after <= now {
            return Err(IdentityError::ChainIntegrity(format!(
                "parent identity {} expired",
                presented.serial
            )));
        }

        self.signer.verify_certificate(presented, now)?;
        if presented.subject != parent.subject.to_string() {
            return Err(IdentityError::ChainIntegrity(format!(
                "presented certificate names {}, not {}",
                presented.subject, parent.subject
            )));
        }

        let entry = self
            .datastore(self.store.fetch_registration_entry(&request.entry_id))
            .await?
            .ok_or_else(|| {
                IdentityError::ChainIntegrity(format!(
                    "registration entry {} does not exist",
                    request.entry_id
                ))
            })?;
        if entry.parent_id != parent.subject {
            return Err(IdentityError::ChainIntegrity(format!(
                "registration entry {} is not delegated to {}",
                entry.entry_id, parent.subject
            )));
        }

        // The claims inherited must be the ones the presented certificate
        // carries; a certificate from before the latest re-attestation does not.
        let inherited = record.last_claims.clone();
        let snapshot_document = inherited.as_ref().map(|s| s.document.as_slice());
        if snapshot_document != presented.claims_document() {
            return Err(IdentityError::ChainIntegrity(format!(
                "certificate {} does not carry the parent's latest attested claims; present the renewed identity",
                presented.serial
            )));
        }
        if let Some(snapshot) = &inherited {
            let age = now.saturating_sub(snapshot.verified_at);
            let max_age = self.settings.max_inherited_claims_age.as_millis() as u64;
            if age > max_age {
                return Err(IdentityError::ChainIntegrity(format!(
                    "inherited claims are {}s old (limit {}s); parent must re-attest",
                    age / 1_000,
                    max_age / 1_000
                )));
            }
        }

        let lineage = ClaimsLineage {
            parent_id: parent.subject.clone(),
            parent_serial: presented.serial.clone(),
            parent_claims_sha256: presented.claims_document().map(claims_digest),
            claims_verified_at: inherited.as_ref().map(|s| s.verified_at),
        };
        let document = build_claims_document(&ClaimsInput {
            subject: &entry.subject,
            key_source: KeySource::WorkloadKey,
            subject_public_key: &subject_key,
            evidence: None,
            verified_claims: inherited.as_ref().map(|s| &s.claims),
            lineage: Some(&lineage),
            workload_code_hash: request.workload_code_hash.as_deref(),
        })?;

        let ttl = entry
            .svid_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.workload_svid_ttl);
        let not_after = now
            .saturating_add(ttl.as_millis() as u64)
            .min(parent_not_after);

        let mut extensions = BTreeMap::new();
        extensions.insert(CLAIMS_EXTENSION_OID.to_string(), document.clone());
        let certificate = self.signer.sign_svid(
            SvidParams {
                subject: entry.subject.clone(),
                public_key: subject_key,
                not_after,
                dns_names: entry.dns_names.clone(),
                extensions,
            },
            now,
        )?;

        if record.is_pending(&presented.serial) {
            record.promote_pending();
            record.updated_at = now;
            match self.datastore(self.store.update_record(record)).await {
                Ok(_) => debug!(subject = %parent.subject, "Promoted pending parent certificate"),
                Err(IdentityError::Conflict { .. }) => {
                    debug!(subject = %parent.subject, "Pending promotion lost a race")
                }
                Err(err) => return Err(err),
            }
        }

        Ok(SubordinateIdentity {
            subject: entry.subject,
            expires_at: certificate.not_after,
            cert_chain: vec![certificate, presented.clone()],
            claims_document: document,
            inherited_claims: inherited.map(|s| s.claims),
            lineage,
        })
    }

    async fn datastore<T, F>(&self, fut: F) -> IdentityResult<T>
    where
        F: std::future::Future<Output = IdentityResult<T>>,
    {
        with_deadline(self.settings.datastore_deadline, "datastore", fut).await
    }
}
