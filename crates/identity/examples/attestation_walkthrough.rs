//! Example: host → agent → workload identity chain
//!
//! Walks one device through hardware attestation against a static verifier,
//! then mints a workload identity that inherits the host's claims.
//!
//! Usage:
//! ```bash
//! cargo run --example attestation_walkthrough [-- path/to/broker.toml]
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use std::sync::Arc;

use sovereign_core::logging;
use sovereign_identity::{
    verify_identity_chain, AttestRequest, AttestationPayload, Broker, BrokerConfig,
    CertificateRequest, Evidence, Geolocation, GpuMetrics, InMemoryIdentityStore,
    IntegrityStatus, ParentIdentity, RegistrationEntry, StaticVerifier, SubjectId,
    SubordinateRequest, TracingAuditSink, VerifiedClaims,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::from_file(path)?,
        None => {
            let mut config = BrokerConfig::default();
            config.policy.allowed_geolocations = vec!["Spain: *".to_string()];
            config
        }
    };
    logging::init_from_config(&config.logging)?;

    let claims = VerifiedClaims {
        geolocation: Some(Geolocation {
            kind: "mobile".to_string(),
            sensor_id: "gnss-0".to_string(),
            value: Some("Spain: N40.4168, W3.7038".to_string()),
        }),
        host_integrity_status: IntegrityStatus::PassedAllChecks,
        gpu_metrics: Some(GpuMetrics {
            status: Some("healthy".to_string()),
            utilization_pct: Some(15.0),
            memory_mb: Some(10_240),
        }),
    };
    let broker = Broker::assemble(
        &config,
        Arc::new(InMemoryIdentityStore::new()),
        Arc::new(StaticVerifier::new(claims)),
        Arc::new(TracingAuditSink),
    )?;

    // Agent: the app key doubles as the identity key.
    let app_key = SigningKey::random(&mut OsRng);
    let challenge = broker.attestation.issue_challenge()?;
    let evidence = Evidence {
        quote: BASE64.encode(b"demo-quote"),
        app_key_public: BASE64.encode(app_key.verifying_key().to_encoded_point(false).as_bytes()),
        app_key_certificate: None,
        nonce: challenge.nonce,
        workload_code_hash: None,
        registrar_id: Some("d432fbb3-d2f1-4a97-9ef7-75bd81c00000".to_string()),
    };
    let agent = broker
        .attestation
        .attest(AttestRequest {
            csr: CertificateRequest::new(&app_key, vec![]),
            payload: AttestationPayload::Evidence(evidence),
        })
        .await?;
    tracing::info!(subject = %agent.subject, expires_at = agent.expires_at, "Agent attested");

    // Workload: authorized by a registration entry, no verifier round-trip.
    let workload = SubjectId::parse(&format!("spiffe://{}/workload/web", broker.trust_domain))?;
    broker
        .issuance
        .register_entry(RegistrationEntry {
            entry_id: "web".to_string(),
            parent_id: agent.subject.clone(),
            subject: workload,
            dns_names: vec!["web.example.org".to_string()],
            svid_ttl_ms: None,
        })
        .await?;

    let parent_certificate = agent
        .certificate()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("attestation returned an empty chain"))?;
    let subordinate = broker
        .issuance
        .issue_subordinate(
            &ParentIdentity::new(agent.subject.clone(), parent_certificate),
            SubordinateRequest {
                entry_id: "web".to_string(),
                csr: CertificateRequest::new(&SigningKey::random(&mut OsRng), vec![]),
                workload_code_hash: Some("sha256:5d41402abc4b2a76b9719d911017c592".to_string()),
            },
        )
        .await?;

    verify_identity_chain(
        &subordinate.cert_chain,
        broker.authority.as_ref(),
        sovereign_core::now_ms(),
    )?;
    tracing::info!(
        subject = %subordinate.subject,
        parent = %subordinate.lineage.parent_id,
        "Workload identity chained to attested host"
    );
    println!("{}", String::from_utf8_lossy(&subordinate.claims_document));

    Ok(())
}
