//! Verified claims and the canonical claims document.
//!
//! The document is JSON with a fixed field order (struct declaration order)
//! under `grc.*` keys. It is built once per issuance, embedded in the
//! certificate under [`CLAIMS_EXTENSION_OID`], and never edited afterwards:
//! recomposing from the same inputs yields the same bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IdentityError, IdentityResult};
use crate::keys;
use crate::subject::SubjectId;
use crate::verifier::Evidence;

/// Certificate extension carrying the claims document (non-critical).
pub const CLAIMS_EXTENSION_OID: &str = "1.3.6.1.4.1.99999.1";

/// PCR the TPM extends with the geolocation reading.
pub const GEOLOCATION_PCR_INDEX: u32 = 15;

/// Host integrity verdict from the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntegrityStatus {
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "passed_all_checks", alias = "passed")]
    PassedAllChecks,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "partial", alias = "partial_checks")]
    Partial,
}

impl IntegrityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityStatus::Unspecified => "unspecified",
            IntegrityStatus::PassedAllChecks => "passed_all_checks",
            IntegrityStatus::Failed => "failed",
            IntegrityStatus::Partial => "partial",
        }
    }
}

/// Where the subject is, as read from a TPM-bound sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geolocation {
    /// Sensor class, e.g. `mobile` or `gnss`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sensor_id: String,
    /// Location reading, e.g. `US` or `Spain: Madrid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
}

/// Facts the verifier attested to after checking the evidence.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VerifiedClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    #[serde(default)]
    pub host_integrity_status: IntegrityStatus,
    #[serde(
        default,
        rename = "gpu_metrics_health",
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu_metrics: Option<GpuMetrics>,
}

/// Provenance of the subject's operational key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    /// The key is the TPM-resident app key itself
    #[serde(rename = "tpm-app-key")]
    TpmAppKey,
    /// The key was generated by the workload and is embedded explicitly
    #[serde(rename = "workload-key")]
    WorkloadKey,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::TpmAppKey => "tpm-app-key",
            KeySource::WorkloadKey => "workload-key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadClaim {
    #[serde(rename = "workload-id")]
    pub workload_id: String,
    #[serde(rename = "key-source")]
    pub key_source: KeySource,
    #[serde(rename = "public-key", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(
        rename = "workload-code-hash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub workload_code_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmAttestationClaim {
    #[serde(rename = "app-key-public")]
    pub app_key_public: String,
    #[serde(
        rename = "app-key-certificate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub app_key_certificate: Option<String>,
    #[serde(rename = "quote-sha256")]
    pub quote_sha256: String,
    #[serde(rename = "challenge-nonce")]
    pub challenge_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeolocationClaim {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sensor-id")]
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "tpm-attested-location")]
    pub tpm_attested_location: bool,
    #[serde(rename = "tpm-attested-pcr-index")]
    pub tpm_attested_pcr_index: u32,
}

impl From<&Geolocation> for GeolocationClaim {
    fn from(geo: &Geolocation) -> Self {
        Self {
            kind: geo.kind.clone(),
            sensor_id: geo.sensor_id.clone(),
            value: geo.value.clone(),
            tpm_attested_location: true,
            tpm_attested_pcr_index: GEOLOCATION_PCR_INDEX,
        }
    }
}

/// Reference from a subordinate document to the parent it inherits from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsLineage {
    #[serde(rename = "parent-id")]
    pub parent_id: SubjectId,
    #[serde(rename = "parent-serial")]
    pub parent_serial: String,
    /// Digest of the parent's embedded document; absent for claim-less parents
    #[serde(
        rename = "parent-claims-sha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_claims_sha256: Option<String>,
    #[serde(
        rename = "claims-verified-at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub claims_verified_at: Option<u64>,
}

/// The canonical claims document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsDocument {
    #[serde(rename = "grc.workload")]
    pub workload: WorkloadClaim,
    #[serde(
        rename = "grc.tpm-attestation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tpm_attestation: Option<TpmAttestationClaim>,
    #[serde(
        rename = "grc.host-integrity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub host_integrity: Option<IntegrityStatus>,
    #[serde(
        rename = "grc.geolocation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub geolocation: Option<GeolocationClaim>,
    #[serde(
        rename = "grc.gpu-metrics",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu_metrics: Option<GpuMetrics>,
    #[serde(
        rename = "grc.inherited-from",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inherited_from: Option<ClaimsLineage>,
}

impl ClaimsDocument {
    pub fn to_canonical_bytes(&self) -> IdentityResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IdentityError::Composition(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| IdentityError::Composition(format!("unreadable claims document: {e}")))
    }
}

/// Inputs to [`build_claims_document`].
#[derive(Debug, Clone, Copy)]
pub struct ClaimsInput<'a> {
    pub subject: &'a SubjectId,
    pub key_source: KeySource,
    /// SEC1 encoding of the key being certified
    pub subject_public_key: &'a [u8],
    /// Hardware evidence; required for [`KeySource::TpmAppKey`]
    pub evidence: Option<&'a Evidence>,
    pub verified_claims: Option<&'a VerifiedClaims>,
    pub lineage: Option<&'a ClaimsLineage>,
    /// Used when no evidence carries a code hash
    pub workload_code_hash: Option<&'a str>,
}

/// Build the document for `input`. Pure; fails only on malformed inputs.
pub fn compose(input: &ClaimsInput<'_>) -> IdentityResult<ClaimsDocument> {
    let subject_key = keys::public_key_from_sec1(input.subject_public_key)
        .map_err(|_| IdentityError::Composition("unparseable subject public key".to_string()))?;

    let code_hash = input
        .evidence
        .and_then(|e| e.workload_code_hash.as_deref())
        .or(input.workload_code_hash)
        .map(str::to_string);

    match input.key_source {
        KeySource::TpmAppKey => {
            let evidence = input.evidence.ok_or_else(|| {
                IdentityError::Composition("tpm-app-key source requires evidence".to_string())
            })?;
            let claims = input.verified_claims.ok_or_else(|| {
                IdentityError::Composition(
                    "tpm-app-key source requires verified claims".to_string(),
                )
            })?;

            let app_key = keys::decode_public_key(&evidence.app_key_public).map_err(|_| {
                IdentityError::Composition("unparseable app key in evidence".to_string())
            })?;
            if keys::sec1_bytes(&app_key) != keys::sec1_bytes(&subject_key) {
                return Err(IdentityError::Composition(
                    "subject key does not match the hardware app key".to_string(),
                ));
            }

            let quote = BASE64.decode(evidence.quote.trim()).map_err(|_| {
                IdentityError::Composition("quote is not valid base64".to_string())
            })?;

            Ok(ClaimsDocument {
                workload: WorkloadClaim {
                    workload_id: input.subject.to_string(),
                    key_source: KeySource::TpmAppKey,
                    public_key: None,
                    workload_code_hash: code_hash,
                },
                tpm_attestation: Some(TpmAttestationClaim {
                    app_key_public: keys::public_key_pem(&app_key)?,
                    app_key_certificate: evidence
                        .app_key_certificate
                        .as_ref()
                        .map(|der| BASE64.encode(der)),
                    quote_sha256: hex::encode(Sha256::digest(&quote)),
                    challenge_nonce: evidence.nonce.clone(),
                }),
                host_integrity: Some(claims.host_integrity_status),
                geolocation: claims.geolocation.as_ref().map(GeolocationClaim::from),
                gpu_metrics: claims.gpu_metrics.clone(),
                inherited_from: input.lineage.cloned(),
            })
        }
        KeySource::WorkloadKey => Ok(ClaimsDocument {
            workload: WorkloadClaim {
                workload_id: input.subject.to_string(),
                key_source: KeySource::WorkloadKey,
                public_key: Some(keys::public_key_pem(&subject_key)?),
                workload_code_hash: code_hash,
            },
            tpm_attestation: None,
            host_integrity: input.verified_claims.map(|c| c.host_integrity_status),
            geolocation: input
                .verified_claims
                .and_then(|c| c.geolocation.as_ref())
                .map(GeolocationClaim::from),
            gpu_metrics: input.verified_claims.and_then(|c| c.gpu_metrics.clone()),
            inherited_from: input.lineage.cloned(),
        }),
    }
}

/// Canonical bytes of the document for `input`.
pub fn build_claims_document(input: &ClaimsInput<'_>) -> IdentityResult<Vec<u8>> {
    compose(input)?.to_canonical_bytes()
}

/// Hex SHA-256 of a claims document.
pub fn claims_digest(document: &[u8]) -> String {
    hex::encode(Sha256::digest(document))
}
