mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{attest, claims_at, config, harness, Agent, Script};
use sovereign_identity::{
    build_claims_document, AttestRequest, AttestationMethod, AttestationPayload, AuditOutcome,
    CertificateSigner, ClaimsDocument, ClaimsInput, FreshnessViolation, IdentityError,
    IdentityRecord, IdentityStore, IntegrityStatus, KeySource, PolicyRule, RenewOutcome,
    RenewRequest, SubjectDerivation, SubjectId,
};

#[tokio::test]
async fn integration_attest_with_healthy_host_in_allowed_region() {
    let h = harness(config(), Script::Verified(claims_at("Spain: N40.4168, W3.7038")));
    let agent = Agent::new(Some("d432fbb3-d2f1-4a97-9ef7-75bd81c00000"));

    let issued = attest(&h, &agent).await.unwrap();

    assert_eq!(
        issued.subject.to_string(),
        "spiffe://example.org/agent/unified_identity/d432fbb3-d2f1-4a97-9ef7-75bd81c00000"
    );
    assert!(issued.reattestable);
    assert_eq!(h.verifier.calls(), 1);

    let cert = issued.certificate().unwrap();
    assert_eq!(cert.public_key, agent.app_key_sec1());
    assert_eq!(cert.claims_document(), issued.claims_document.as_deref());
    h.broker
        .authority
        .verify_certificate(cert, sovereign_core::now_ms())
        .unwrap();

    let document = ClaimsDocument::from_bytes(cert.claims_document().unwrap()).unwrap();
    assert_eq!(document.workload.key_source, KeySource::TpmAppKey);
    assert_eq!(document.host_integrity, Some(IntegrityStatus::PassedAllChecks));
    assert_eq!(
        document.geolocation.unwrap().value.as_deref(),
        Some("Spain: N40.4168, W3.7038")
    );
    assert!(document.inherited_from.is_none());

    let record = h
        .broker
        .attestation
        .fetch_record(&issued.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.cert_serial, cert.serial);
    assert!(record.can_reattest);

    let event = h.audit.last().unwrap();
    assert_eq!(event.outcome, AuditOutcome::Issued);
    assert_eq!(event.verifier_audit_id.as_deref(), Some("audit-1"));
    assert_eq!(
        event.transitions,
        vec!["awaiting_evidence", "verifying", "policy_evaluating", "issuing", "issued"]
    );
    assert!(event.nonce_digest.is_some());
}

#[tokio::test]
async fn integration_rejected_evidence_creates_no_record() {
    let h = harness(config(), Script::Rejected("quote signature invalid"));
    let agent = Agent::new(Some("device-1"));

    let err = attest(&h, &agent).await.unwrap_err();
    assert_eq!(err.reason_code(), "verification_failure");
    assert_eq!(err.audit_id(), Some("audit-rejected"));

    let subject = SubjectId::parse("spiffe://example.org/agent/unified_identity/device-1").unwrap();
    assert!(h.broker.attestation.fetch_record(&subject).await.unwrap().is_none());

    let event = h.audit.last().unwrap();
    assert_eq!(event.outcome, AuditOutcome::Denied);
    assert!(event.reason.unwrap().contains("quote signature invalid"));
    assert_eq!(event.transitions.last().map(String::as_str), Some("denied"));
}

#[tokio::test]
async fn integration_geofence_denial_is_redacted_for_caller() {
    let h = harness(config(), Script::Verified(claims_at("CN")));
    let agent = Agent::new(Some("device-cn"));

    match attest(&h, &agent).await.unwrap_err() {
        IdentityError::PolicyDenial { rule, reason } => {
            assert_eq!(rule, PolicyRule::Geofence);
            assert!(!reason.contains("CN"));
        }
        other => panic!("expected policy denial, got {other:?}"),
    }

    let event = h.audit.last().unwrap();
    assert_eq!(event.reason_code.as_deref(), Some("policy_denial.geofence"));
    assert!(event.reason.unwrap().contains("\"CN\""));
}

#[tokio::test]
async fn integration_denial_details_exposed_when_configured() {
    let mut config = config();
    config.server.expose_denial_details = true;
    let h = harness(config, Script::Verified(claims_at("CN")));

    let err = attest(&h, &Agent::new(Some("device-cn"))).await.unwrap_err();
    assert!(err.to_string().contains("\"CN\""));
}

#[tokio::test]
async fn integration_nonce_replay_is_rejected_before_verifier() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-2"));
    let challenge = h.broker.attestation.issue_challenge().unwrap();
    let request = AttestRequest {
        csr: agent.csr(),
        payload: AttestationPayload::Evidence(agent.evidence(&challenge.nonce)),
    };

    h.broker.attestation.attest(request.clone()).await.unwrap();
    let err = h.broker.attestation.attest(request).await.unwrap_err();

    assert!(matches!(
        err,
        IdentityError::FreshnessViolation(FreshnessViolation::Reused)
    ));
    assert_eq!(h.verifier.calls(), 1);
}

#[tokio::test]
async fn integration_unknown_nonce_is_rejected() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(None);
    let err = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: agent.csr(),
            payload: AttestationPayload::Evidence(agent.evidence(&"ab".repeat(32))),
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "freshness_violation.unknown");
    assert_eq!(h.verifier.calls(), 0);
}

#[tokio::test]
async fn integration_concurrent_submissions_of_one_nonce() {
    let h = Arc::new(harness(config(), Script::Verified(claims_at("Spain: Madrid"))));
    let agent = Agent::new(Some("device-race"));
    let challenge = h.broker.attestation.issue_challenge().unwrap();
    let request = AttestRequest {
        csr: agent.csr(),
        payload: AttestationPayload::Evidence(agent.evidence(&challenge.nonce)),
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&h.broker.attestation);
        let request = request.clone();
        handles.push(tokio::spawn(async move { service.attest(request).await }));
    }

    let mut issued = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => issued += 1,
            Err(err) => assert!(matches!(
                err,
                IdentityError::FreshnessViolation(FreshnessViolation::Reused)
            )),
        }
    }
    assert_eq!(issued, 1);
    assert_eq!(h.verifier.calls(), 1);
}

#[tokio::test]
async fn integration_banned_subject_never_reaches_verifier() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-ban"));
    let issued = attest(&h, &agent).await.unwrap();

    h.broker.attestation.ban(&issued.subject).await.unwrap();
    assert_eq!(h.audit.count(AuditOutcome::Banned), 1);

    let err = attest(&h, &agent).await.unwrap_err();
    assert!(matches!(err, IdentityError::Banned { .. }));
    assert_eq!(h.verifier.calls(), 1);

    let event = h.audit.last().unwrap();
    assert_eq!(event.transitions, vec!["awaiting_evidence", "denied"]);
}

#[tokio::test]
async fn integration_subject_falls_back_to_key_fingerprint() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(None);

    let issued = attest(&h, &agent).await.unwrap();

    let expected = SubjectDerivation::ByKeyFingerprint(agent.app_key_sec1())
        .derive(&h.broker.trust_domain)
        .unwrap();
    assert_eq!(issued.subject, expected);
    assert!(issued
        .subject
        .path()
        .starts_with("/agent/unified_identity/appkey-"));
}

#[tokio::test]
async fn integration_csr_key_must_be_the_app_key() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let device = Agent::new(Some("device-3"));
    let impostor = Agent::new(None);
    let challenge = h.broker.attestation.issue_challenge().unwrap();

    let err = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: impostor.csr(),
            payload: AttestationPayload::Evidence(device.evidence(&challenge.nonce)),
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason_code(), "composition_error");
    assert_eq!(h.audit.last().unwrap().outcome, AuditOutcome::Failed);
}

#[tokio::test]
async fn integration_embedded_claims_recompose_identically() {
    let claims = claims_at("Spain: Madrid");
    let h = harness(config(), Script::Verified(claims.clone()));
    let agent = Agent::new(Some("device-4"));
    let challenge = h.broker.attestation.issue_challenge().unwrap();
    let evidence = agent.evidence(&challenge.nonce);

    let issued = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: agent.csr(),
            payload: AttestationPayload::Evidence(evidence.clone()),
        })
        .await
        .unwrap();
    let cert = issued.certificate().unwrap();

    let recomposed = build_claims_document(&ClaimsInput {
        subject: &issued.subject,
        key_source: KeySource::TpmAppKey,
        subject_public_key: &cert.public_key,
        evidence: Some(&evidence),
        verified_claims: Some(&claims),
        lineage: None,
        workload_code_hash: None,
    })
    .unwrap();
    assert_eq!(Some(recomposed.as_slice()), cert.claims_document());

    let snapshot = h
        .broker
        .attestation
        .attested_claims(&issued.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.document, recomposed);
    assert_eq!(snapshot.claims, claims);
}

#[tokio::test]
async fn integration_reattestation_updates_record() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-5"));
    let first = attest(&h, &agent).await.unwrap();

    h.verifier.set(Script::Verified(claims_at("Spain: Barcelona")));
    let second = attest(&h, &agent).await.unwrap();
    assert_eq!(first.subject, second.subject);

    let record = h
        .broker
        .attestation
        .fetch_record(&second.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.revision, 2);
    assert_eq!(record.cert_serial, second.certificate().unwrap().serial);
    assert_eq!(
        record.last_claims.unwrap().claims.geolocation.unwrap().value.as_deref(),
        Some("Spain: Barcelona")
    );

    let old = ClaimsDocument::from_bytes(first.certificate().unwrap().claims_document().unwrap())
        .unwrap();
    assert_eq!(old.geolocation.unwrap().value.as_deref(), Some("Spain: Madrid"));
}

#[tokio::test]
async fn integration_renewal_requires_fresh_evidence() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-6"));
    let issued = attest(&h, &agent).await.unwrap();

    let outcome = h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: None,
            },
        )
        .await
        .unwrap();
    let challenge = match outcome {
        RenewOutcome::EvidenceRequired(challenge) => challenge,
        RenewOutcome::Renewed(_) => panic!("re-attestable subject renewed without evidence"),
    };
    assert_eq!(h.audit.count(AuditOutcome::EvidenceRequested), 1);

    let outcome = h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: Some(agent.evidence(&challenge.nonce)),
            },
        )
        .await
        .unwrap();
    let renewed = match outcome {
        RenewOutcome::Renewed(renewed) => renewed,
        RenewOutcome::EvidenceRequired(_) => panic!("evidence was supplied"),
    };
    assert!(renewed.claims_document.is_some());
    assert_eq!(h.verifier.calls(), 2);

    let record = h
        .broker
        .attestation
        .fetch_record(&issued.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.cert_serial, issued.certificate().unwrap().serial);
    assert_eq!(
        record.new_cert_serial.as_deref(),
        Some(renewed.certificate().unwrap().serial.as_str())
    );
}

#[tokio::test]
async fn integration_renewal_rejects_first_attestation_nonce() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-7"));
    let issued = attest(&h, &agent).await.unwrap();

    let unscoped = h.broker.attestation.issue_challenge().unwrap();
    let err = h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: Some(agent.evidence(&unscoped.nonce)),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "freshness_violation.scope_mismatch");
}

#[tokio::test]
async fn integration_renewal_with_another_devices_evidence() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-8"));
    let other = Agent::new(Some("device-9"));
    let issued = attest(&h, &agent).await.unwrap();

    let challenge = match h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: None,
            },
        )
        .await
        .unwrap()
    {
        RenewOutcome::EvidenceRequired(challenge) => challenge,
        RenewOutcome::Renewed(_) => panic!("expected a challenge"),
    };

    let err = h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: other.csr(),
                evidence: Some(other.evidence(&challenge.nonce)),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "verification_failure");
    assert_eq!(h.verifier.calls(), 1);
}

#[tokio::test]
async fn integration_renewal_of_unknown_subject() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(None);
    let subject = SubjectId::parse("spiffe://example.org/agent/unified_identity/ghost").unwrap();

    let err = h
        .broker
        .attestation
        .renew(
            &subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::NotFound { .. }));
    assert!(err.is_denial());
}

#[tokio::test]
async fn integration_join_token_attestation_and_simple_renewal() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(None);
    let token = h
        .broker
        .attestation
        .create_join_token(Duration::from_secs(600), Some("bootstrap-1".to_string()))
        .await
        .unwrap();

    let request = AttestRequest {
        csr: agent.csr(),
        payload: AttestationPayload::JoinToken(token.token.clone()),
    };
    let issued = h.broker.attestation.attest(request.clone()).await.unwrap();
    assert_eq!(
        issued.subject.to_string(),
        "spiffe://example.org/agent/join_token/bootstrap-1"
    );
    assert!(!issued.reattestable);
    assert!(issued.claims_document.is_none());
    assert!(issued.certificate().unwrap().claims_document().is_none());
    assert_eq!(h.verifier.calls(), 0);

    let err = h.broker.attestation.attest(request).await.unwrap_err();
    assert!(matches!(err, IdentityError::JoinTokenRejected(_)));

    let renewed = match h
        .broker
        .attestation
        .renew(
            &issued.subject,
            RenewRequest {
                csr: agent.csr(),
                evidence: None,
            },
        )
        .await
        .unwrap()
    {
        RenewOutcome::Renewed(renewed) => renewed,
        RenewOutcome::EvidenceRequired(_) => panic!("join token subjects cannot re-attest"),
    };
    assert!(renewed.claims_document.is_none());
    assert_eq!(h.audit.count(AuditOutcome::Renewed), 1);
}

#[tokio::test]
async fn integration_expired_join_token() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let token = h
        .broker
        .attestation
        .create_join_token(Duration::ZERO, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: Agent::new(None).csr(),
            payload: AttestationPayload::JoinToken(token.token),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::JoinTokenRejected(_)));
}

#[tokio::test]
async fn integration_disabled_attestation_paths() {
    let mut config = config();
    config.server.unified_identity_enabled = false;
    config.server.allow_join_tokens = false;
    let h = harness(config, Script::Verified(claims_at("Spain: Madrid")));

    assert!(matches!(
        h.broker.attestation.issue_challenge(),
        Err(IdentityError::FeatureDisabled(_))
    ));
    let err = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: Agent::new(None).csr(),
            payload: AttestationPayload::JoinToken("anything".to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "feature_disabled");
}

#[tokio::test]
async fn integration_disabled_reattestation_issues_no_nonce() {
    let mut config = config();
    config.server.unified_identity_enabled = false;
    let h = harness(config, Script::Verified(claims_at("Spain: Madrid")));
    let device = Agent::new(Some("host-disabled"));
    let subject = SubjectId::parse("spiffe://example.org/agent/unified_identity/host-disabled")
        .unwrap();
    h.store
        .create_record(IdentityRecord::new(
            subject.clone(),
            AttestationMethod::HardwareEvidence,
            "aa".to_string(),
            u64::MAX,
            0,
        ))
        .await
        .unwrap();

    let err = h
        .broker
        .attestation
        .renew(
            &subject,
            RenewRequest {
                csr: device.csr(),
                evidence: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "feature_disabled");
    assert_eq!(h.broker.nonces.tracked(), 0);
}

#[tokio::test]
async fn integration_verifier_deadline() {
    let h = harness(config(), Script::Hang(Duration::from_secs(5)));
    let agent = Agent::new(Some("device-slow"));

    let err = attest(&h, &agent).await.unwrap_err();
    assert_eq!(err.reason_code(), "transport.verifier");
    assert!(err.is_retryable());
    assert_eq!(h.audit.last().unwrap().outcome, AuditOutcome::Failed);

    let subject = SubjectId::parse("spiffe://example.org/agent/unified_identity/device-slow").unwrap();
    assert!(h.broker.attestation.fetch_record(&subject).await.unwrap().is_none());
}

#[tokio::test]
async fn integration_unavailable_verifier_is_a_failure() {
    let h = harness(config(), Script::Unavailable);
    let err = attest(&h, &Agent::new(None)).await.unwrap_err();
    assert!(!err.is_denial());
    assert_eq!(h.audit.count(AuditOutcome::Failed), 1);
}

#[tokio::test]
async fn integration_concurrent_renewals_of_one_subject() {
    let h = Arc::new(harness(config(), Script::Verified(claims_at("Spain: Madrid"))));
    let agent = Agent::new(None);
    let token = h
        .broker
        .attestation
        .create_join_token(Duration::from_secs(60), None)
        .await
        .unwrap();
    let issued = h
        .broker
        .attestation
        .attest(AttestRequest {
            csr: agent.csr(),
            payload: AttestationPayload::JoinToken(token.token),
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&h.broker.attestation);
        let subject = issued.subject.clone();
        let csr = agent.csr();
        handles.push(tokio::spawn(async move {
            service
                .renew(&subject, RenewRequest { csr, evidence: None })
                .await
        }));
    }

    let mut renewed = 0u64;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => renewed += 1,
            Err(err) => assert!(matches!(err, IdentityError::Conflict { .. })),
        }
    }
    assert!(renewed >= 1);

    let record = h
        .broker
        .attestation
        .fetch_record(&issued.subject)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.revision, 1 + renewed);
}

#[tokio::test]
async fn integration_delete_forces_fresh_attestation() {
    let h = harness(config(), Script::Verified(claims_at("Spain: Madrid")));
    let agent = Agent::new(Some("device-10"));
    let issued = attest(&h, &agent).await.unwrap();

    h.broker.attestation.delete(&issued.subject).await.unwrap();
    assert!(h
        .broker
        .attestation
        .fetch_record(&issued.subject)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.audit.count(AuditOutcome::Deleted), 1);

    let again = attest(&h, &agent).await.unwrap();
    assert_eq!(again.subject, issued.subject);
}
