//! Service assembly from configuration.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use sovereign_core::{BrokerConfig, DatastoreBackend};

use crate::attestation::{AgentAttestationService, AttestationComponents, AttestationSettings};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::error::{IdentityError, IdentityResult};
use crate::issuance::{IdentityIssuanceService, IssuanceSettings};
use crate::nonce::NonceManager;
use crate::pki::CertificateAuthority;
use crate::policy::PolicyEngine;
use crate::store::{IdentityStore, InMemoryIdentityStore};
use crate::subject::TrustDomain;
use crate::verifier::{Evidence, EvidenceVerifier, KeylimeVerifierClient, VerificationReport};

/// Both services wired to one store, signer and nonce manager.
pub struct Broker {
    pub trust_domain: TrustDomain,
    pub authority: Arc<CertificateAuthority>,
    pub nonces: Arc<NonceManager>,
    pub attestation: Arc<AgentAttestationService>,
    pub issuance: Arc<IdentityIssuanceService>,
}

impl Broker {
    /// Build a broker with the configured datastore and the HTTP verifier.
    pub fn from_config(config: &BrokerConfig) -> IdentityResult<Self> {
        config.validate()?;

        let store: Arc<dyn IdentityStore> = match config.datastore.backend {
            DatastoreBackend::Memory => Arc::new(InMemoryIdentityStore::new()),
            #[cfg(feature = "sqlite")]
            DatastoreBackend::Sqlite => {
                let path = config.datastore.path.as_deref().ok_or_else(|| {
                    IdentityError::Core(sovereign_core::CoreError::Config(
                        "datastore.path is required for the sqlite backend".to_string(),
                    ))
                })?;
                Arc::new(crate::sqlite_store::SqliteIdentityStore::open(path)?)
            }
            #[cfg(not(feature = "sqlite"))]
            DatastoreBackend::Sqlite => {
                return Err(IdentityError::Core(sovereign_core::CoreError::Config(
                    "sqlite backend requires the `sqlite` feature".to_string(),
                )))
            }
        };

        let verifier: Arc<dyn EvidenceVerifier> = if config.server.unified_identity_enabled {
            Arc::new(KeylimeVerifierClient::from_config(&config.verifier)?)
        } else {
            Arc::new(DisabledVerifier)
        };

        Self::assemble(config, store, verifier, Arc::new(TracingAuditSink))
    }

    /// Build a broker around caller-supplied collaborators.
    pub fn assemble(
        config: &BrokerConfig,
        store: Arc<dyn IdentityStore>,
        verifier: Arc<dyn EvidenceVerifier>,
        audit: Arc<dyn AuditSink>,
    ) -> IdentityResult<Self> {
        let trust_domain = TrustDomain::new(config.server.trust_domain.clone())?;
        let authority = Arc::new(CertificateAuthority::generate(
            &trust_domain,
            config.issuance.ca_validity(),
        )?);
        let nonces = Arc::new(NonceManager::from_config(&config.nonce));
        let policy = Arc::new(PolicyEngine::new(&config.policy)?);

        let attestation = Arc::new(AgentAttestationService::new(
            AttestationSettings::from_config(config),
            AttestationComponents {
                trust_domain: trust_domain.clone(),
                nonces: Arc::clone(&nonces),
                verifier,
                policy,
                signer: authority.clone(),
                store: Arc::clone(&store),
                audit: Arc::clone(&audit),
            },
        ));
        let issuance = Arc::new(IdentityIssuanceService::new(
            trust_domain.clone(),
            IssuanceSettings::from_config(config),
            authority.clone(),
            store,
            audit,
        ));

        info!(
            trust_domain = %trust_domain,
            ca_id = %authority.ca_id(),
            unified_identity = config.server.unified_identity_enabled,
            join_tokens = config.server.allow_join_tokens,
            "Identity broker assembled"
        );

        Ok(Self {
            trust_domain,
            authority,
            nonces,
            attestation,
            issuance,
        })
    }
}

/// Stand-in when hardware attestation is switched off.
struct DisabledVerifier;

#[async_trait]
impl EvidenceVerifier for DisabledVerifier {
    async fn verify_evidence(&self, _evidence: &Evidence) -> IdentityResult<VerificationReport> {
        warn!("Evidence submitted while hardware attestation is disabled");
        Err(IdentityError::FeatureDisabled(
            "hardware-evidence attestation is disabled".to_string(),
        ))
    }
}
