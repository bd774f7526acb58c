//! Hardware-rooted identity issuance.
//!
//! An agent proves its host's state with TPM evidence answering a
//! single-use nonce. An external verifier checks the evidence, a fail-closed
//! policy engine judges the verified claims, and the broker signs an identity
//! certificate carrying a canonical claims document. Attested agents can then
//! request subordinate workload identities that inherit those claims without
//! any further verifier round-trip.
//!
//! # Flow
//!
//! ```text
//! issue_challenge ─▶ attest(evidence) ─▶ verifier ─▶ policy ─▶ compose ─▶ sign
//!                                                                          │
//!             issue_subordinate(parent cert, entry) ◀──────── agent identity
//! ```
//!
//! # Security Model
//!
//! - Nonces are consumed atomically, exactly once, within their TTL
//! - Missing, malformed or unknown claims never satisfy a policy rule
//! - A banned subject is rejected before any verifier call
//! - The claims embedded in a certificate are never changed after signing
//! - Every external call runs under a deadline; nothing is retried

pub mod attestation;
pub mod audit;
pub mod broker;
pub mod claims;
pub mod error;
pub mod issuance;
pub mod keys;
pub mod nonce;
pub mod pki;
pub mod policy;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod subject;
pub mod verifier;

pub use attestation::{
    AgentAttestationService, AttestRequest, AttestationComponents, AttestationPayload,
    AttestationSession, AttestationSettings, AttestationState, IssuedIdentity, RenewOutcome,
    RenewRequest,
};
pub use audit::{AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use broker::Broker;
pub use claims::{
    build_claims_document, claims_digest, ClaimsDocument, ClaimsInput, ClaimsLineage, Geolocation,
    GpuMetrics, IntegrityStatus, KeySource, VerifiedClaims, CLAIMS_EXTENSION_OID,
};
pub use error::{FreshnessViolation, IdentityError, IdentityResult, Outcome};
pub use issuance::{
    IdentityIssuanceService, IssuanceSettings, ParentIdentity, SubordinateIdentity,
    SubordinateRequest,
};
pub use nonce::{Challenge, NonceManager, NonceScope};
pub use pki::{
    verify_identity_chain, Certificate, CertificateAuthority, CertificateRequest,
    CertificateSigner, SvidParams,
};
pub use policy::{PolicyDecision, PolicyEngine, PolicyRule};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteIdentityStore;
pub use store::{
    AttestationMethod, AttestedClaimsSnapshot, IdentityRecord, IdentityStore,
    InMemoryIdentityStore, JoinToken, RegistrationEntry,
};
pub use subject::{SubjectDerivation, SubjectId, TrustDomain};
pub use verifier::{
    Evidence, EvidenceLimits, EvidenceVerifier, KeylimeVerifierClient, StaticVerifier,
    VerificationDetails, VerificationReport, MAX_RESPONSE_BYTES,
};

// Re-export core types for convenience
pub use sovereign_core::BrokerConfig;
