//! Error types for identity issuance.
//!
//! Every error classifies itself as either a denial (a legitimate security
//! decision about the subject) or a failure (protocol misuse, a bug, or an
//! unavailable dependency). Audit logs and alerting key off that split.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::policy::PolicyRule;

/// Why a freshness nonce was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessViolation {
    /// No nonce was supplied
    Missing,
    /// The nonce was never issued or has already been purged
    Unknown,
    /// The nonce outlived its window
    Expired,
    /// The nonce was already consumed
    Reused,
    /// The nonce was issued for a different attempt or subject
    ScopeMismatch,
}

impl FreshnessViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessViolation::Missing => "missing",
            FreshnessViolation::Unknown => "unknown",
            FreshnessViolation::Expired => "expired",
            FreshnessViolation::Reused => "reused",
            FreshnessViolation::ScopeMismatch => "scope_mismatch",
        }
    }
}

impl fmt::Display for FreshnessViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Denied,
    Failed,
}

/// Errors that can occur while attesting subjects and issuing identities.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Nonce missing, expired, reused or bound elsewhere
    #[error("Freshness violation: nonce {0}")]
    FreshnessViolation(FreshnessViolation),

    /// The external verifier rejected the evidence
    #[error("Evidence verification failed: {reason}")]
    VerificationFailure {
        reason: String,
        audit_id: Option<String>,
    },

    /// Claims verified but a policy rule denied issuance
    #[error("Policy denied issuance ({rule}): {reason}")]
    PolicyDenial { rule: PolicyRule, reason: String },

    /// Claims document could not be built from the inputs
    #[error("Claims composition error: {0}")]
    Composition(String),

    /// Parent identity is absent, banned, expired or does not verify
    #[error("Chain integrity error: {0}")]
    ChainIntegrity(String),

    /// Verifier or datastore unreachable or past its deadline
    #[error("Transport error ({component}): {message}")]
    Transport {
        component: &'static str,
        message: String,
    },

    /// Subject is banned
    #[error("Subject is banned: {subject}")]
    Banned { subject: String },

    /// Join token unknown, used or expired
    #[error("Join token rejected: {0}")]
    JoinTokenRejected(String),

    /// No identity record for the subject
    #[error("Identity not found: {subject}")]
    NotFound { subject: String },

    /// Request fields failed local well-formedness checks
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Attestation path switched off by configuration
    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    /// Optimistic update lost a race for the same subject
    #[error("Concurrent update conflict for {subject}")]
    Conflict { subject: String },

    /// Bounded table is full
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Certificate Authority errors
    #[error("CA error: {0}")]
    CertificateAuthority(String),

    /// Datastore errors other than unavailability
    #[error("Datastore error: {0}")]
    Datastore(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] sovereign_core::CoreError),
}

impl IdentityError {
    pub fn transport(component: &'static str, message: impl Into<String>) -> Self {
        IdentityError::Transport {
            component,
            message: message.into(),
        }
    }

    pub fn verification(reason: impl Into<String>, audit_id: Option<String>) -> Self {
        IdentityError::VerificationFailure {
            reason: reason.into(),
            audit_id,
        }
    }

    /// Whether this error is a security decision or a system failure.
    pub fn outcome(&self) -> Outcome {
        match self {
            IdentityError::FreshnessViolation(_)
            | IdentityError::VerificationFailure { .. }
            | IdentityError::PolicyDenial { .. }
            | IdentityError::ChainIntegrity(_)
            | IdentityError::Banned { .. }
            | IdentityError::JoinTokenRejected(_)
            | IdentityError::NotFound { .. } => Outcome::Denied,
            _ => Outcome::Failed,
        }
    }

    pub fn is_denial(&self) -> bool {
        self.outcome() == Outcome::Denied
    }

    /// Only transport errors may be retried, and only with a fresh nonce.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IdentityError::Transport { .. })
    }

    /// Machine-readable reason string for callers and audit records.
    pub fn reason_code(&self) -> String {
        match self {
            IdentityError::FreshnessViolation(kind) => format!("freshness_violation.{kind}"),
            IdentityError::VerificationFailure { .. } => "verification_failure".to_string(),
            IdentityError::PolicyDenial { rule, .. } => format!("policy_denial.{rule}"),
            IdentityError::Composition(_) => "composition_error".to_string(),
            IdentityError::ChainIntegrity(_) => "chain_integrity".to_string(),
            IdentityError::Transport { component, .. } => format!("transport.{component}"),
            IdentityError::Banned { .. } => "banned".to_string(),
            IdentityError::JoinTokenRejected(_) => "join_token_rejected".to_string(),
            IdentityError::NotFound { .. } => "not_found".to_string(),
            IdentityError::InvalidRequest(_) => "invalid_request".to_string(),
            IdentityError::FeatureDisabled(_) => "feature_disabled".to_string(),
            IdentityError::Conflict { .. } => "conflict".to_string(),
            IdentityError::ResourceExhausted(_) => "resource_exhausted".to_string(),
            IdentityError::InvalidState(_) => "invalid_state".to_string(),
            IdentityError::CertificateAuthority(_) => "certificate_authority".to_string(),
            IdentityError::Datastore(_) => "datastore".to_string(),
            IdentityError::Serialization(_) => "serialization".to_string(),
            IdentityError::Core(_) => "core".to_string(),
        }
    }

    /// Verifier audit identifier, when the verifier returned one.
    pub fn audit_id(&self) -> Option<&str> {
        match self {
            IdentityError::VerificationFailure { audit_id, .. } => audit_id.as_deref(),
            _ => None,
        }
    }

    /// Strip the human-readable detail of a denial before it reaches the
    /// subject. Failures pass through untouched.
    pub fn redacted(self) -> Self {
        match self {
            IdentityError::VerificationFailure { audit_id, .. } => {
                IdentityError::VerificationFailure {
                    reason: "evidence rejected".to_string(),
                    audit_id,
                }
            }
            IdentityError::PolicyDenial { rule, .. } => IdentityError::PolicyDenial {
                rule,
                reason: "issuance not permitted".to_string(),
            },
            IdentityError::ChainIntegrity(_) => {
                IdentityError::ChainIntegrity("parent identity not acceptable".to_string())
            }
            IdentityError::JoinTokenRejected(_) => {
                IdentityError::JoinTokenRejected("token not accepted".to_string())
            }
            other => other,
        }
    }
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
