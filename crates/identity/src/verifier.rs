//! Evidence verifier client.
//!
//! The external verifier is authoritative for quote signatures, PCR and IMA
//! allowlists and app key provenance. This module only makes sure what we
//! send is bounded and well formed, and reads the verdict fail-closed:
//! anything short of an explicit, complete "verified" is a denial.
//!
//! No retries happen here. A transport error surfaces to the caller, who must
//! restart with a fresh nonce.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use der::{asn1::AnyRef, Decode, Tag, Tagged};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use sovereign_core::VerifierConfig;

use crate::claims::VerifiedClaims;
use crate::error::{IdentityError, IdentityResult};
use crate::keys;
use crate::nonce::NONCE_LEN;
use crate::subject::validate_segment;

/// Verifier endpoint path for app-key evidence.
pub const VERIFY_EVIDENCE_PATH: &str = "/v2.4/verify/evidence";

/// Default quote bound (64 KiB decoded).
pub const MAX_QUOTE_BYTES: usize = 64 * 1024;

/// Default app key certificate bound (16 KiB DER).
pub const MAX_APP_KEY_CERTIFICATE_BYTES: usize = 16 * 1024;

/// Largest verifier response body we will parse.
pub const MAX_RESPONSE_BYTES: usize = 256 * 1024;

const MAX_CODE_HASH_LEN: usize = 256;
const COMPONENT: &str = "verifier";

/// Hardware evidence submitted by a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Base64 TPM quote
    pub quote: String,
    /// App key as PEM SPKI or base64 SEC1
    pub app_key_public: String,
    /// DER certificate binding the app key to the TPM attestation key
    #[serde(default)]
    pub app_key_certificate: Option<Vec<u8>>,
    /// Hex nonce from the challenge
    pub nonce: String,
    #[serde(default)]
    pub workload_code_hash: Option<String>,
    /// Registrar-issued device identifier
    #[serde(default)]
    pub registrar_id: Option<String>,
}

/// Size bounds applied before anything leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidenceLimits {
    pub max_quote_bytes: usize,
    pub max_certificate_bytes: usize,
}

impl Default for EvidenceLimits {
    fn default() -> Self {
        Self {
            max_quote_bytes: MAX_QUOTE_BYTES,
            max_certificate_bytes: MAX_APP_KEY_CERTIFICATE_BYTES,
        }
    }
}

impl From<&VerifierConfig> for EvidenceLimits {
    fn from(config: &VerifierConfig) -> Self {
        Self {
            max_quote_bytes: config.max_quote_bytes,
            max_certificate_bytes: config.max_certificate_bytes,
        }
    }
}

impl Evidence {
    /// Check sizes and encodings. Returns the parsed app key.
    pub fn validate(&self, limits: &EvidenceLimits) -> IdentityResult<p256::PublicKey> {
        let quote = self.quote.trim();
        if quote.is_empty() {
            return Err(invalid("quote is required"));
        }
        // Bound the encoded form first so oversized input is never decoded.
        let max_encoded = limits.max_quote_bytes.div_ceil(3) * 4;
        if quote.len() > max_encoded {
            return Err(invalid(format!(
                "quote exceeds {} bytes",
                limits.max_quote_bytes
            )));
        }
        let decoded = BASE64
            .decode(quote)
            .map_err(|e| invalid(format!("quote is not valid base64: {e}")))?;
        if decoded.len() > limits.max_quote_bytes {
            return Err(invalid(format!(
                "quote exceeds {} bytes",
                limits.max_quote_bytes
            )));
        }

        let app_key = keys::decode_public_key(&self.app_key_public)?;

        if let Some(cert) = &self.app_key_certificate {
            if cert.len() > limits.max_certificate_bytes {
                return Err(invalid(format!(
                    "app key certificate exceeds {} bytes",
                    limits.max_certificate_bytes
                )));
            }
            let parsed = AnyRef::from_der(cert)
                .map_err(|e| invalid(format!("app key certificate is not DER: {e}")))?;
            if parsed.tag() != Tag::Sequence {
                return Err(invalid("app key certificate is not a DER SEQUENCE"));
            }
        }

        match hex::decode(&self.nonce) {
            Ok(bytes) if bytes.len() == NONCE_LEN => {}
            _ => return Err(invalid("nonce must be 32 hex-encoded bytes")),
        }

        if let Some(hash) = &self.workload_code_hash {
            if hash.is_empty()
                || hash.len() > MAX_CODE_HASH_LEN
                || !hash.chars().all(|c| c.is_ascii_graphic())
            {
                return Err(invalid("workload code hash is malformed"));
            }
        }

        if let Some(id) = &self.registrar_id {
            if !id.trim().is_empty() {
                validate_segment(id.trim())?;
            }
        }

        Ok(app_key)
    }
}

/// Per-check results reported by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationDetails {
    pub app_key_certificate_valid: bool,
    pub app_key_public_matches_cert: bool,
    pub quote_signature_valid: bool,
    pub nonce_valid: bool,
    pub timestamp: i64,
}

/// A successful verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub claims: VerifiedClaims,
    pub details: VerificationDetails,
    pub audit_id: Option<String>,
}

/// Delegated evidence verification.
#[async_trait]
pub trait EvidenceVerifier: Send + Sync {
    async fn verify_evidence(&self, evidence: &Evidence) -> IdentityResult<VerificationReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEvidenceRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: VerifyEvidenceData,
    pub metadata: VerifyEvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEvidenceData {
    pub nonce: String,
    pub quote: String,
    pub hash_alg: &'static str,
    pub app_key_public: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_key_certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_code_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyEvidenceMetadata {
    pub source: &'static str,
    pub submission_type: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyEvidenceResponse {
    pub results: VerificationResults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationResults {
    pub verified: bool,
    #[serde(default)]
    pub verification_details: VerificationDetails,
    #[serde(default)]
    pub attested_claims: Option<VerifiedClaims>,
    #[serde(default)]
    pub audit_id: Option<String>,
}

/// Build the JSON body sent to the verifier.
pub fn build_verify_request(evidence: &Evidence) -> VerifyEvidenceRequest {
    VerifyEvidenceRequest {
        kind: "tpm-app-key",
        data: VerifyEvidenceData {
            nonce: evidence.nonce.clone(),
            quote: evidence.quote.trim().to_string(),
            hash_alg: "sha256",
            app_key_public: evidence.app_key_public.trim().to_string(),
            app_key_certificate: evidence
                .app_key_certificate
                .as_ref()
                .map(|der| BASE64.encode(der)),
            agent_uuid: evidence
                .registrar_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            workload_code_hash: evidence.workload_code_hash.clone(),
        },
        metadata: VerifyEvidenceMetadata {
            source: "sovereign-identity",
            submission_type: "PoR/tpm-app-key",
        },
    }
}

/// Read a verifier verdict. Only an explicit, complete success passes.
pub fn interpret_response(
    response: VerifyEvidenceResponse,
    certificate_submitted: bool,
) -> IdentityResult<VerificationReport> {
    let results = response.results;
    let audit_id = results.audit_id;
    let details = results.verification_details;

    if !results.verified {
        return Err(IdentityError::verification(
            "verifier reported evidence as not verified",
            audit_id,
        ));
    }
    if !details.quote_signature_valid {
        return Err(IdentityError::verification(
            "quote signature not confirmed by verifier",
            audit_id,
        ));
    }
    if !details.nonce_valid {
        return Err(IdentityError::verification(
            "nonce not confirmed by verifier",
            audit_id,
        ));
    }
    if certificate_submitted
        && !(details.app_key_certificate_valid && details.app_key_public_matches_cert)
    {
        return Err(IdentityError::verification(
            "app key certificate chain not confirmed by verifier",
            audit_id,
        ));
    }

    let claims = results.attested_claims.ok_or_else(|| {
        IdentityError::verification("verifier response carries no attested claims", audit_id.clone())
    })?;

    Ok(VerificationReport {
        claims,
        details,
        audit_id,
    })
}

/// HTTP client for a Keylime-style verifier.
#[derive(Debug, Clone)]
pub struct KeylimeVerifierClient {
    endpoint: String,
    http: reqwest::Client,
    limits: EvidenceLimits,
}

impl KeylimeVerifierClient {
    pub fn new(base_url: &str, timeout: Duration, limits: EvidenceLimits) -> IdentityResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::InvalidState(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), VERIFY_EVIDENCE_PATH),
            http,
            limits,
        })
    }

    pub fn from_config(config: &VerifierConfig) -> IdentityResult<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            IdentityError::Core(sovereign_core::CoreError::Config(
                "verifier.url is required for hardware attestation".to_string(),
            ))
        })?;
        Self::new(url, config.timeout(), EvidenceLimits::from(config))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EvidenceVerifier for KeylimeVerifierClient {
    async fn verify_evidence(&self, evidence: &Evidence) -> IdentityResult<VerificationReport> {
        evidence.validate(&self.limits)?;
        let request = build_verify_request(evidence);

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IdentityError::transport(
                COMPONENT,
                format!("verifier returned HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(IdentityError::verification(
                format!("verifier rejected evidence with HTTP {status}"),
                None,
            ));
        }

        let body = read_bounded(response).await?;
        let parsed: VerifyEvidenceResponse = serde_json::from_slice(&body).map_err(|e| {
            IdentityError::verification(format!("malformed verifier response: {e}"), None)
        })?;

        let report = interpret_response(parsed, evidence.app_key_certificate.is_some())?;
        debug!(
            audit_id = report.audit_id.as_deref().unwrap_or("-"),
            "Verifier accepted evidence"
        );
        Ok(report)
    }
}

/// Read at most [`MAX_RESPONSE_BYTES`] of the response body.
async fn read_bounded(mut response: reqwest::Response) -> IdentityResult<Vec<u8>> {
    let oversized = || IdentityError::verification("verifier response exceeds size bound", None);
    if response
        .content_length()
        .is_some_and(|len| len > MAX_RESPONSE_BYTES as u64)
    {
        return Err(oversized());
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(oversized());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Dev-only verifier that checks inputs locally and returns fixed claims.
///
/// Never use outside tests and demos: it performs no cryptographic checks.
#[derive(Debug, Clone)]
pub struct StaticVerifier {
    claims: VerifiedClaims,
    limits: EvidenceLimits,
}

impl StaticVerifier {
    pub fn new(claims: VerifiedClaims) -> Self {
        warn!("STATUS: Evidence verification STUBBED - static claims will be attested");
        Self {
            claims,
            limits: EvidenceLimits::default(),
        }
    }
}

#[async_trait]
impl EvidenceVerifier for StaticVerifier {
    async fn verify_evidence(&self, evidence: &Evidence) -> IdentityResult<VerificationReport> {
        evidence.validate(&self.limits)?;
        Ok(VerificationReport {
            claims: self.claims.clone(),
            details: VerificationDetails {
                app_key_certificate_valid: evidence.app_key_certificate.is_some(),
                app_key_public_matches_cert: evidence.app_key_certificate.is_some(),
                quote_signature_valid: true,
                nonce_valid: true,
                timestamp: sovereign_core::now_ms() as i64 / 1000,
            },
            audit_id: Some(format!("static-{}", uuid::Uuid::new_v4())),
        })
    }
}

fn transport_error(err: reqwest::Error) -> IdentityError {
    if err.is_timeout() {
        IdentityError::transport(COMPONENT, "verifier request timed out")
    } else {
        IdentityError::transport(COMPONENT, err.to_string())
    }
}

fn invalid(message: impl Into<String>) -> IdentityError {
    IdentityError::InvalidRequest(message.into())
}
