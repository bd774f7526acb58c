#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sovereign_identity::{
    AttestRequest, AttestationPayload, Broker, BrokerConfig, CertificateRequest, Evidence,
    EvidenceVerifier, Geolocation, GpuMetrics, IdentityError, IdentityResult,
    InMemoryIdentityStore, IntegrityStatus, IssuedIdentity, MemoryAuditSink, VerificationDetails,
    VerificationReport, VerifiedClaims,
};

/// What the scripted verifier answers.
#[derive(Debug, Clone)]
pub enum Script {
    Verified(VerifiedClaims),
    Rejected(&'static str),
    Unavailable,
    Hang(Duration),
}

/// Verifier double that counts calls.
pub struct ScriptedVerifier {
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvidenceVerifier for ScriptedVerifier {
    async fn verify_evidence(&self, _evidence: &Evidence) -> IdentityResult<VerificationReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        match script {
            Script::Verified(claims) => Ok(VerificationReport {
                claims,
                details: VerificationDetails {
                    app_key_certificate_valid: true,
                    app_key_public_matches_cert: true,
                    quote_signature_valid: true,
                    nonce_valid: true,
                    timestamp: 1_700_000_000,
                },
                audit_id: Some(format!("audit-{}", self.calls())),
            }),
            Script::Rejected(reason) => Err(IdentityError::verification(
                reason,
                Some("audit-rejected".to_string()),
            )),
            Script::Unavailable => Err(IdentityError::transport("verifier", "connection refused")),
            Script::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Err(IdentityError::transport("verifier", "hung verifier woke up"))
            }
        }
    }
}

pub fn claims_at(location: &str) -> VerifiedClaims {
    VerifiedClaims {
        geolocation: Some(Geolocation {
            kind: "mobile".to_string(),
            sensor_id: "gnss-0".to_string(),
            value: Some(location.to_string()),
        }),
        host_integrity_status: IntegrityStatus::PassedAllChecks,
        gpu_metrics: Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: Some(15.0),
            memory_mb: Some(10_240),
        }),
    }
}

/// A device with a TPM-resident app key.
pub struct Agent {
    pub key: SigningKey,
    pub registrar_id: Option<String>,
}

impl Agent {
    pub fn new(registrar_id: Option<&str>) -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
            registrar_id: registrar_id.map(str::to_string),
        }
    }

    pub fn csr(&self) -> CertificateRequest {
        CertificateRequest::new(&self.key, vec![])
    }

    pub fn app_key_sec1(&self) -> Vec<u8> {
        self.key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    pub fn evidence(&self, nonce: &str) -> Evidence {
        Evidence {
            quote: BASE64.encode(b"tpm2b-attest-and-signature"),
            app_key_public: BASE64.encode(self.app_key_sec1()),
            app_key_certificate: None,
            nonce: nonce.to_string(),
            workload_code_hash: None,
            registrar_id: self.registrar_id.clone(),
        }
    }
}

pub struct Harness {
    pub broker: Broker,
    pub verifier: Arc<ScriptedVerifier>,
    pub audit: Arc<MemoryAuditSink>,
    pub store: Arc<InMemoryIdentityStore>,
}

/// Geofenced to Spain; everything else at defaults.
pub fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.policy.allowed_geolocations = vec!["Spain: *".to_string()];
    config.verifier.timeout_secs = 1;
    config
}

pub fn harness(config: BrokerConfig, script: Script) -> Harness {
    let verifier = Arc::new(ScriptedVerifier::new(script));
    let audit = Arc::new(MemoryAuditSink::default());
    let store = Arc::new(InMemoryIdentityStore::new());
    let broker = Broker::assemble(&config, store.clone(), verifier.clone(), audit.clone())
        .expect("broker assembles");
    Harness {
        broker,
        verifier,
        audit,
        store,
    }
}

/// Challenge, then attest with evidence over the fresh nonce.
pub async fn attest(harness: &Harness, agent: &Agent) -> IdentityResult<IssuedIdentity> {
    let challenge = harness.broker.attestation.issue_challenge()?;
    harness
        .broker
        .attestation
        .attest(AttestRequest {
            csr: agent.csr(),
            payload: AttestationPayload::Evidence(agent.evidence(&challenge.nonce)),
        })
        .await
}
