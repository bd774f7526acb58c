//! Agent attestation: the per-attempt state machine and the node service.
//!
//! # State Transitions
//!
//! ```text
//! AwaitingEvidence
//!     ↓ (nonce consumed, or join token / renewal CSR accepted)
//! Verifying
//!     ↓ (verifier returned claims)          ↘ (credential-only paths)
//! PolicyEvaluating                            ↘
//!     ↓ (policy allowed)                        ↘
//! Issuing  ←────────────────────────────────────┘
//!     ↓ (certificate signed, record persisted)
//! Issued
//! ```
//!
//! Any non-terminal state can end in `Denied` (a security decision) or
//! `Failed` (malformed input, an unavailable dependency, or a bug). Once in
//! `Issuing`, only `Failed` is possible.
//!
//! A banned subject is rejected while still in `AwaitingEvidence`, before the
//! verifier is contacted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use sovereign_core::{now_ms, BrokerConfig};

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::claims::{build_claims_document, ClaimsInput, KeySource, VerifiedClaims, CLAIMS_EXTENSION_OID};
use crate::error::{IdentityError, IdentityResult, Outcome};
use crate::keys;
use crate::nonce::{nonce_digest, Challenge, NonceManager, NonceScope};
use crate::pki::{Certificate, CertificateRequest, CertificateSigner, SvidParams};
use crate::policy::PolicyEngine;
use crate::store::{
    AttestationMethod, AttestedClaimsSnapshot, IdentityRecord, IdentityStore, JoinToken,
};
use crate::subject::{validate_segment, SubjectDerivation, SubjectId, TrustDomain};
use crate::verifier::{Evidence, EvidenceLimits, EvidenceVerifier};

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 100;

/// CAS attempts for administrative record updates.
const MAX_ADMIN_UPDATE_ATTEMPTS: usize = 3;

/// State of one attestation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationState {
    /// A nonce or credential is outstanding
    AwaitingEvidence,
    /// Evidence is with the verifier
    Verifying,
    /// Claims verified, rules being applied
    PolicyEvaluating,
    /// Composing claims, signing and persisting
    Issuing,
    /// Identity issued
    Issued { serial: String },
    /// Security decision against the subject
    Denied { reason_code: String },
    /// Protocol error, bug, or unavailable dependency
    Failed { reason_code: String },
}

impl AttestationState {
    pub fn name(&self) -> &'static str {
        match self {
            AttestationState::AwaitingEvidence => "awaiting_evidence",
            AttestationState::Verifying => "verifying",
            AttestationState::PolicyEvaluating => "policy_evaluating",
            AttestationState::Issuing => "issuing",
            AttestationState::Issued { .. } => "issued",
            AttestationState::Denied { .. } => "denied",
            AttestationState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttestationState::Issued { .. }
                | AttestationState::Denied { .. }
                | AttestationState::Failed { .. }
        )
    }
}

/// Record of a state transition for audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    pub timestamp: u64,
    pub reason: Option<String>,
    /// BLAKE3 over `from->to;timestamp`
    pub transition_hash: Vec<u8>,
}

/// State machine for a single attestation or renewal attempt.
#[derive(Debug)]
pub struct AttestationSession {
    attempt_id: String,
    subject: Option<SubjectId>,
    state: AttestationState,
    history: VecDeque<StateTransition>,
}

impl AttestationSession {
    pub fn new() -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            subject: None,
            state: AttestationState::AwaitingEvidence,
            history: VecDeque::with_capacity(8),
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn state(&self) -> &AttestationState {
        &self.state
    }

    pub fn subject(&self) -> Option<&SubjectId> {
        self.subject.as_ref()
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// State names visited, starting with the initial state.
    pub fn visited(&self) -> Vec<String> {
        let mut names = vec![AttestationState::AwaitingEvidence.name().to_string()];
        names.extend(self.history.iter().map(|t| t.to_state.clone()));
        names
    }

    pub fn bind_subject(&mut self, subject: SubjectId) {
        self.subject = Some(subject);
    }

    /// Transition: AwaitingEvidence → Verifying
    pub fn on_evidence_accepted(&mut self) -> IdentityResult<()> {
        self.require_state(&AttestationState::AwaitingEvidence, "accept evidence")?;
        self.transition(AttestationState::Verifying, Some("evidence accepted".to_string()));
        Ok(())
    }

    /// Transition: Verifying → PolicyEvaluating
    pub fn on_claims_verified(&mut self) -> IdentityResult<()> {
        self.require_state(&AttestationState::Verifying, "accept verified claims")?;
        self.transition(
            AttestationState::PolicyEvaluating,
            Some("verifier returned claims".to_string()),
        );
        Ok(())
    }

    /// Transition: PolicyEvaluating → Issuing
    pub fn on_policy_allowed(&mut self) -> IdentityResult<()> {
        self.require_state(&AttestationState::PolicyEvaluating, "apply policy allow")?;
        self.transition(AttestationState::Issuing, Some("policy allowed".to_string()));
        Ok(())
    }

    /// Transition: Verifying → Issuing, for paths that carry no claims.
    pub fn on_credential_accepted(&mut self) -> IdentityResult<()> {
        self.require_state(&AttestationState::Verifying, "accept credential")?;
        self.transition(AttestationState::Issuing, Some("credential accepted".to_string()));
        Ok(())
    }

    /// Transition: Issuing → Issued
    pub fn on_issued(&mut self, serial: String) -> IdentityResult<()> {
        self.require_state(&AttestationState::Issuing, "finish issuance")?;
        self.transition(AttestationState::Issued { serial }, None);
        Ok(())
    }

    /// Move to `Denied` or `Failed` according to `err`. No-op once terminal.
    pub fn conclude(&mut self, err: &IdentityError) {
        if self.state.is_terminal() {
            return;
        }
        let reason_code = err.reason_code();
        let next = match (err.outcome(), &self.state) {
            (Outcome::Denied, state) if *state != AttestationState::Issuing => {
                AttestationState::Denied { reason_code }
            }
            _ => AttestationState::Failed { reason_code },
        };
        self.transition(next, Some(err.to_string()));
    }

    fn require_state(&self, expected: &AttestationState, action: &str) -> IdentityResult<()> {
        if self.state == *expected {
            Ok(())
        } else {
            Err(IdentityError::InvalidState(format!(
                "cannot {action} from state {}",
                self.state.name()
            )))
        }
    }

    fn transition(&mut self, new_state: AttestationState, reason: Option<String>) {
        let now = now_ms();
        let from_state = self.state.name().to_string();
        let to_state = new_state.name().to_string();

        let transition_data = format!("{from_state}->{to_state};{now}");
        let transition_hash = blake3::hash(transition_data.as_bytes()).as_bytes().to_vec();

        debug!(
            attempt_id = %self.attempt_id,
            from = %from_state,
            to = %to_state,
            "Attestation state transition"
        );

        self.state = new_state;
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason,
            transition_hash,
        });
    }
}

impl Default for AttestationSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut` under `deadline`, mapping expiry to a transport error.
pub(crate) async fn with_deadline<T, F>(
    deadline: Duration,
    component: &'static str,
    fut: F,
) -> IdentityResult<T>
where
    F: Future<Output = IdentityResult<T>>,
{
    tokio::time::timeout(deadline, fut).await.unwrap_or_else(|_| {
        Err(IdentityError::transport(
            component,
            format!("deadline of {}ms exceeded", deadline.as_millis()),
        ))
    })
}

/// Construction-time switches and bounds for [`AgentAttestationService`].
#[derive(Debug, Clone)]
pub struct AttestationSettings {
    /// Hardware-evidence attestation on or off
    pub unified_identity_enabled: bool,
    pub allow_join_tokens: bool,
    pub expose_denial_details: bool,
    pub agent_svid_ttl: Duration,
    pub verifier_deadline: Duration,
    pub datastore_deadline: Duration,
    pub evidence_limits: EvidenceLimits,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

impl AttestationSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            unified_identity_enabled: config.server.unified_identity_enabled,
            allow_join_tokens: config.server.allow_join_tokens,
            expose_denial_details: config.server.expose_denial_details,
            agent_svid_ttl: config.issuance.agent_svid_ttl(),
            verifier_deadline: config.verifier.timeout(),
            datastore_deadline: config.datastore.timeout(),
            evidence_limits: EvidenceLimits::from(&config.verifier),
        }
    }
}

/// Collaborators shared with the rest of the broker.
#[derive(Clone)]
pub struct AttestationComponents {
    pub trust_domain: TrustDomain,
    pub nonces: Arc<NonceManager>,
    pub verifier: Arc<dyn EvidenceVerifier>,
    pub policy: Arc<PolicyEngine>,
    pub signer: Arc<dyn CertificateSigner>,
    pub store: Arc<dyn IdentityStore>,
    pub audit: Arc<dyn AuditSink>,
}

/// How an agent proves itself on first attestation.
#[derive(Debug, Clone)]
pub enum AttestationPayload {
    /// Pre-shared single-use token
    JoinToken(String),
    /// TPM evidence answering a challenge from [`AgentAttestationService::issue_challenge`]
    Evidence(Evidence),
}

#[derive(Debug, Clone)]
pub struct AttestRequest {
    pub csr: CertificateRequest,
    pub payload: AttestationPayload,
}

#[derive(Debug, Clone)]
pub struct RenewRequest {
    pub csr: CertificateRequest,
    /// Fresh evidence, for subjects that must re-attest
    pub evidence: Option<Evidence>,
}

/// A signed identity and what it attests.
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    pub subject: SubjectId,
    /// Issued certificate first
    pub cert_chain: Vec<Certificate>,
    pub expires_at: u64,
    /// Byte-identical copy of the embedded claims document
    pub claims_document: Option<Vec<u8>>,
    pub verified_claims: Option<VerifiedClaims>,
    /// Renewal will require fresh evidence
    pub reattestable: bool,
    pub verifier_audit_id: Option<String>,
}

impl IssuedIdentity {
    pub fn certificate(&self) -> Option<&Certificate> {
        self.cert_chain.first()
    }
}

#[derive(Debug, Clone)]
pub enum RenewOutcome {
    Renewed(IssuedIdentity),
    /// Submit evidence over this nonce to complete the renewal
    EvidenceRequired(Challenge),
}

/// Output of the verify → policy → compose → sign pipeline.
struct AttestedIssue {
    certificate: Certificate,
    snapshot: AttestedClaimsSnapshot,
}

/// Node attestation and renewal service.
pub struct AgentAttestationService {
    trust_domain: TrustDomain,
    settings: AttestationSettings,
    nonces: Arc<NonceManager>,
    verifier: Arc<dyn EvidenceVerifier>,
    policy: Arc<PolicyEngine>,
    signer: Arc<dyn CertificateSigner>,
    store: Arc<dyn IdentityStore>,
    audit: Arc<dyn AuditSink>,
}

impl AgentAttestationService {
    pub fn new(settings: AttestationSettings, components: AttestationComponents) -> Self {
        if !settings.unified_identity_enabled {
            info!("Hardware-evidence attestation disabled by configuration");
        }
        Self {
            trust_domain: components.trust_domain,
            settings,
            nonces: components.nonces,
            verifier: components.verifier,
            policy: components.policy,
            signer: components.signer,
            store: components.store,
            audit: components.audit,
        }
    }

    pub fn settings(&self) -> &AttestationSettings {
        &self.settings
    }

    /// Issue a nonce for a first-time hardware attestation.
    pub fn issue_challenge(&self) -> IdentityResult<Challenge> {
        if !self.settings.unified_identity_enabled {
            return Err(self.present(IdentityError::FeatureDisabled(
                "hardware-evidence attestation is disabled".to_string(),
            )));
        }
        self.nonces.issue(NonceScope::Attestation)
    }

    /// First-time attestation, or full re-attestation of a known device.
    pub async fn attest(&self, request: AttestRequest) -> IdentityResult<IssuedIdentity> {
        let AttestRequest { csr, payload } = request;
        let mut session = AttestationSession::new();

        let (result, digest) = match &payload {
            AttestationPayload::JoinToken(token) => {
                (self.attest_with_join_token(&mut session, &csr, token).await, None)
            }
            AttestationPayload::Evidence(evidence) => (
                self.attest_with_evidence(&mut session, &csr, evidence).await,
                Some(nonce_digest(&evidence.nonce)),
            ),
        };

        match result {
            Ok(issued) => {
                self.record_success("attest_agent", &session, &issued, AuditOutcome::Issued, digest);
                Ok(issued)
            }
            Err(err) => Err(self.record_failure("attest_agent", &mut session, err, digest)),
        }
    }

    /// Renew an existing identity. `caller` is the authenticated subject.
    pub async fn renew(
        &self,
        caller: &SubjectId,
        request: RenewRequest,
    ) -> IdentityResult<RenewOutcome> {
        let mut session = AttestationSession::new();
        session.bind_subject(caller.clone());
        let digest = request.evidence.as_ref().map(|e| nonce_digest(&e.nonce));

        match self.renew_inner(&mut session, caller, request).await {
            Ok(RenewOutcome::Renewed(issued)) => {
                self.record_success("renew_agent", &session, &issued, AuditOutcome::Renewed, digest);
                Ok(RenewOutcome::Renewed(issued))
            }
            Ok(RenewOutcome::EvidenceRequired(challenge)) => {
                let event = AuditEvent::new("renew_agent", AuditOutcome::EvidenceRequested)
                    .with_subject(caller)
                    .with_nonce_digest(Some(nonce_digest(&challenge.nonce)))
                    .with_transitions(session.visited());
                self.audit.record(event);
                Ok(RenewOutcome::EvidenceRequired(challenge))
            }
            Err(err) => Err(self.record_failure("renew_agent", &mut session, err, digest)),
        }
    }

    /// Ban a subject. Blocks all future issuance for it and its subordinates.
    pub async fn ban(&self, subject: &SubjectId) -> IdentityResult<()> {
        let result = self
            .update_with_retry(subject, |record| record.banned = true)
            .await;
        match result {
            Ok(_) => {
                info!(subject = %subject, "Subject banned");
                self.audit
                    .record(AuditEvent::new("ban_agent", AuditOutcome::Banned).with_subject(subject));
                Ok(())
            }
            Err(err) => {
                self.audit
                    .record(AuditEvent::from_error("ban_agent", &err).with_subject(subject));
                Err(err)
            }
        }
    }

    /// Remove a subject's record. The subject must attest again from scratch.
    pub async fn delete(&self, subject: &SubjectId) -> IdentityResult<()> {
        self.datastore(self.store.delete_record(subject)).await?;
        self.audit
            .record(AuditEvent::new("delete_agent", AuditOutcome::Deleted).with_subject(subject));
        Ok(())
    }

    /// Create a single-use join token valid for `ttl`. A random token is
    /// generated when none is given.
    pub async fn create_join_token(
        &self,
        ttl: Duration,
        token: Option<String>,
    ) -> IdentityResult<JoinToken> {
        if !self.settings.allow_join_tokens {
            return Err(IdentityError::FeatureDisabled(
                "join token attestation is disabled".to_string(),
            ));
        }
        let token = match token {
            Some(token) => {
                validate_segment(&token)?;
                token
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let token = JoinToken {
            token,
            expires_at: now_ms().saturating_add(ttl.as_millis() as u64),
        };
        self.datastore(self.store.create_join_token(token.clone()))
            .await?;
        Ok(token)
    }

    pub async fn fetch_record(&self, subject: &SubjectId) -> IdentityResult<Option<IdentityRecord>> {
        self.datastore(self.store.fetch_record(subject)).await
    }

    /// Read-through copy of the claims embedded at the last attestation.
    pub async fn attested_claims(
        &self,
        subject: &SubjectId,
    ) -> IdentityResult<Option<AttestedClaimsSnapshot>> {
        Ok(self
            .fetch_record(subject)
            .await?
            .and_then(|record| record.last_claims))
    }

    async fn attest_with_join_token(
        &self,
        session: &mut AttestationSession,
        csr: &CertificateRequest,
        token: &str,
    ) -> IdentityResult<IssuedIdentity> {
        if !self.settings.allow_join_tokens {
            return Err(IdentityError::FeatureDisabled(
                "join token attestation is disabled".to_string(),
            ));
        }
        validate_segment(token)
            .map_err(|_| IdentityError::JoinTokenRejected("malformed join token".to_string()))?;
        let public_key = csr.verify()?;

        let join_token = self
            .datastore(self.store.take_join_token(token))
            .await?
            .ok_or_else(|| {
                IdentityError::JoinTokenRejected(
                    "join token does not exist or has already been used".to_string(),
                )
            })?;
        let now = now_ms();
        if join_token.expires_at < now {
            return Err(IdentityError::JoinTokenRejected("join token expired".to_string()));
        }

        let subject = SubjectId::for_join_token(&self.trust_domain, token)?;
        session.bind_subject(subject.clone());
        let existing = self.fetch_unbanned(&subject).await?;

        session.on_evidence_accepted()?;
        session.on_credential_accepted()?;

        let certificate = self.sign(&subject, public_key, &csr.dns_names, None, now)?;
        let record = match existing {
            Some(mut record) => {
                record.cert_serial = certificate.serial.clone();
                record.cert_not_after = certificate.not_after;
                record.new_cert_serial = None;
                record.new_cert_not_after = None;
                record.updated_at = now;
                self.datastore(self.store.update_record(record)).await?
            }
            None => {
                let record = IdentityRecord::new(
                    subject.clone(),
                    AttestationMethod::JoinToken,
                    certificate.serial.clone(),
                    certificate.not_after,
                    now,
                );
                self.datastore(self.store.create_record(record)).await?
            }
        };

        session.on_issued(certificate.serial.clone())?;
        info!(subject = %subject, serial = %certificate.serial, "Agent attested with join token");

        Ok(IssuedIdentity {
            subject,
            expires_at: certificate.not_after,
            cert_chain: vec![certificate],
            claims_document: None,
            verified_claims: None,
            reattestable: record.can_reattest,
            verifier_audit_id: None,
        })
    }

    async fn attest_with_evidence(
        &self,
        session: &mut AttestationSession,
        csr: &CertificateRequest,
        evidence: &Evidence,
    ) -> IdentityResult<IssuedIdentity> {
        if !self.settings.unified_identity_enabled {
            return Err(IdentityError::FeatureDisabled(
                "hardware-evidence attestation is disabled".to_string(),
            ));
        }
        self.nonces.consume(&evidence.nonce, &NonceScope::Attestation)?;

        let app_key = evidence.validate(&self.settings.evidence_limits)?;
        let subject_key = csr.verify()?;
        let derivation = SubjectDerivation::select(
            evidence.registrar_id.as_deref(),
            &keys::sec1_bytes(&app_key),
        );
        let subject = derivation.derive(&self.trust_domain)?;
        debug!(subject = %subject, derivation = derivation.kind(), "Derived subject from evidence");
        session.bind_subject(subject.clone());

        let existing = self.fetch_unbanned(&subject).await?;
        session.on_evidence_accepted()?;

        let issued = self
            .verify_and_issue(session, &subject, evidence, subject_key, &csr.dns_names)
            .await?;
        let now = now_ms();
        let AttestedIssue {
            certificate,
            snapshot,
        } = issued;

        let record = match existing {
            Some(mut record) => {
                record.attestation_method = AttestationMethod::HardwareEvidence;
                record.cert_serial = certificate.serial.clone();
                record.cert_not_after = certificate.not_after;
                record.new_cert_serial = None;
                record.new_cert_not_after = None;
                record.can_reattest = true;
                record.last_claims = Some(snapshot.clone());
                record.updated_at = now;
                self.datastore(self.store.update_record(record)).await?
            }
            None => {
                let mut record = IdentityRecord::new(
                    subject.clone(),
                    AttestationMethod::HardwareEvidence,
                    certificate.serial.clone(),
                    certificate.not_after,
                    now,
                );
                record.last_claims = Some(snapshot.clone());
                self.datastore(self.store.create_record(record)).await?
            }
        };

        session.on_issued(certificate.serial.clone())?;
        info!(subject = %subject, serial = %certificate.serial, "Agent attested with hardware evidence");

        Ok(IssuedIdentity {
            subject,
            expires_at: certificate.not_after,
            cert_chain: vec![certificate],
            claims_document: Some(snapshot.document),
            verified_claims: Some(snapshot.claims),
            reattestable: record.can_reattest,
            verifier_audit_id: snapshot.audit_id,
        })
    }

    async fn renew_inner(
        &self,
        session: &mut AttestationSession,
        caller: &SubjectId,
        request: RenewRequest,
    ) -> IdentityResult<RenewOutcome> {
        let mut record = self
            .datastore(self.store.fetch_record(caller))
            .await?
            .ok_or_else(|| IdentityError::NotFound {
                subject: caller.to_string(),
            })?;
        if record.banned {
            return Err(IdentityError::Banned {
                subject: caller.to_string(),
            });
        }

        if !record.can_reattest {
            let public_key = request.csr.verify()?;
            session.on_evidence_accepted()?;
            session.on_credential_accepted()?;

            let now = now_ms();
            let certificate = self.sign(caller, public_key, &request.csr.dns_names, None, now)?;
            record.new_cert_serial = Some(certificate.serial.clone());
            record.new_cert_not_after = Some(certificate.not_after);
            record.updated_at = now;
            let record = self.datastore(self.store.update_record(record)).await?;

            session.on_issued(certificate.serial.clone())?;
            return Ok(RenewOutcome::Renewed(IssuedIdentity {
                subject: caller.clone(),
                expires_at: certificate.not_after,
                cert_chain: vec![certificate],
                claims_document: None,
                verified_claims: None,
                reattestable: record.can_reattest,
                verifier_audit_id: None,
            }));
        }

        if !self.settings.unified_identity_enabled {
            return Err(IdentityError::FeatureDisabled(
                "hardware-evidence attestation is disabled".to_string(),
            ));
        }
        let Some(evidence) = request.evidence else {
            let challenge = self.nonces.issue(NonceScope::Subject(caller.clone()))?;
            debug!(subject = %caller, "Renewal requires fresh evidence");
            return Ok(RenewOutcome::EvidenceRequired(challenge));
        };
        self.nonces
            .consume(&evidence.nonce, &NonceScope::Subject(caller.clone()))?;

        let app_key = evidence.validate(&self.settings.evidence_limits)?;
        let subject_key = request.csr.verify()?;
        let derived = SubjectDerivation::select(
            evidence.registrar_id.as_deref(),
            &keys::sec1_bytes(&app_key),
        )
        .derive(&self.trust_domain)?;
        if derived != *caller {
            return Err(IdentityError::verification(
                format!("evidence identifies {derived}, not the renewing subject"),
                None,
            ));
        }
        session.on_evidence_accepted()?;

        let AttestedIssue {
            certificate,
            snapshot,
        } = self
            .verify_and_issue(session, caller, &evidence, subject_key, &request.csr.dns_names)
            .await?;

        let now = now_ms();
        record.new_cert_serial = Some(certificate.serial.clone());
        record.new_cert_not_after = Some(certificate.not_after);
        record.last_claims = Some(snapshot.clone());
        record.updated_at = now;
        let record = self.datastore(self.store.update_record(record)).await?;

        session.on_issued(certificate.serial.clone())?;
        info!(subject = %caller, serial = %certificate.serial, "Agent re-attested on renewal");

        Ok(RenewOutcome::Renewed(IssuedIdentity {
            subject: caller.clone(),
            expires_at: certificate.not_after,
            cert_chain: vec![certificate],
            claims_document: Some(snapshot.document),
            verified_claims: Some(snapshot.claims),
            reattestable: record.can_reattest,
            verifier_audit_id: snapshot.audit_id,
        }))
    }

    /// Verifying → PolicyEvaluating → Issuing, ending with a signed certificate.
    async fn verify_and_issue(
        &self,
        session: &mut AttestationSession,
        subject: &SubjectId,
        evidence: &Evidence,
        subject_key: Vec<u8>,
        dns_names: &[String],
    ) -> IdentityResult<AttestedIssue> {
        let report = with_deadline(
            self.settings.verifier_deadline,
            "verifier",
            self.verifier.verify_evidence(evidence),
        )
        .await?;
        session.on_claims_verified()?;

        self.policy.evaluate(&report.claims).into_result()?;
        session.on_policy_allowed()?;

        let document = build_claims_document(&ClaimsInput {
            subject,
            key_source: KeySource::TpmAppKey,
            subject_public_key: &subject_key,
            evidence: Some(evidence),
            verified_claims: Some(&report.claims),
            lineage: None,
            workload_code_hash: None,
        })?;

        let now = now_ms();
        let certificate = self.sign(subject, subject_key, dns_names, Some(document.clone()), now)?;

        Ok(AttestedIssue {
            certificate,
            snapshot: AttestedClaimsSnapshot {
                claims: report.claims,
                document,
                verified_at: now,
                audit_id: report.audit_id,
            },
        })
    }

    fn sign(
        &self,
        subject: &SubjectId,
        public_key: Vec<u8>,
        dns_names: &[String],
        claims_document: Option<Vec<u8>>,
        now: u64,
    ) -> IdentityResult<Certificate> {
        let mut extensions = BTreeMap::new();
        if let Some(document) = claims_document {
            extensions.insert(CLAIMS_EXTENSION_OID.to_string(), document);
        }
        self.signer.sign_svid(
            SvidParams {
                subject: subject.clone(),
                public_key,
                not_after: now.saturating_add(self.settings.agent_svid_ttl.as_millis() as u64),
                dns_names: dns_names.to_vec(),
                extensions,
            },
            now,
        )
    }

    /// Fetch a record, rejecting banned subjects.
    async fn fetch_unbanned(&self, subject: &SubjectId) -> IdentityResult<Option<IdentityRecord>> {
        let existing = self.datastore(self.store.fetch_record(subject)).await?;
        if existing.as_ref().is_some_and(|record| record.banned) {
            return Err(IdentityError::Banned {
                subject: subject.to_string(),
            });
        }
        Ok(existing)
    }

    async fn update_with_retry<F>(&self, subject: &SubjectId, mutate: F) -> IdentityResult<IdentityRecord>
    where
        F: Fn(&mut IdentityRecord) + Send + Sync,
    {
        let mut last_err = None;
        for _ in 0..MAX_ADMIN_UPDATE_ATTEMPTS {
            let mut record = self
                .datastore(self.store.fetch_record(subject))
                .await?
                .ok_or_else(|| IdentityError::NotFound {
                    subject: subject.to_string(),
                })?;
            mutate(&mut record);
            record.updated_at = now_ms();
            match self.datastore(self.store.update_record(record)).await {
                Ok(stored) => return Ok(stored),
                Err(err @ IdentityError::Conflict { .. }) => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| IdentityError::Conflict {
            subject: subject.to_string(),
        }))
    }

    async fn datastore<T, F>(&self, fut: F) -> IdentityResult<T>
    where
        F: Future<Output = IdentityResult<T>>,
    {
        with_deadline(self.settings.datastore_deadline, "datastore", fut).await
    }

    fn record_success(
        &self,
        operation: &str,
        session: &AttestationSession,
        issued: &IssuedIdentity,
        outcome: AuditOutcome,
        digest: Option<String>,
    ) {
        let mut event = AuditEvent::new(operation, outcome)
            .with_subject(&issued.subject)
            .with_verifier_audit_id(issued.verifier_audit_id.clone())
            .with_nonce_digest(digest)
            .with_transitions(session.visited());
        if let Some(cert) = issued.certificate() {
            event = event.with_serial(cert.serial.clone());
        }
        self.audit.record(event);
    }

    /// Conclude the session, audit the full error, return what the caller may see.
    fn record_failure(
        &self,
        operation: &str,
        session: &mut AttestationSession,
        err: IdentityError,
        digest: Option<String>,
    ) -> IdentityError {
        session.conclude(&err);
        let mut event = AuditEvent::from_error(operation, &err)
            .with_nonce_digest(digest)
            .with_transitions(session.visited());
        if let Some(subject) = session.subject() {
            event = event.with_subject(subject);
        }
        self.audit.record(event);
        self.present(err)
    }

    fn present(&self, err: IdentityError) -> IdentityError {
        if self.settings.expose_denial_details {
            err
        } else {
            err.redacted()
        }
    }
}
