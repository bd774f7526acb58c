//! Certificates, certificate requests and the CA seam.
//!
//! Certificates are signed with P-256 ECDSA over a canonical serialization of
//! every field except the signature. Extensions are kept in a `BTreeMap` so
//! that serialization is stable. The claims document rides in the
//! [`CLAIMS_EXTENSION_OID`] extension.

use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;
use tracing::info;

use crate::claims::{ClaimsDocument, CLAIMS_EXTENSION_OID};
use crate::error::{IdentityError, IdentityResult};
use crate::keys;
use crate::subject::{SubjectId, TrustDomain};

/// Domain separator for CSR proof-of-possession signatures.
const CSR_CONTEXT: &[u8] = b"sovereign-identity/csr/v1";

/// Serial number size in bytes.
pub const SERIAL_LEN: usize = 16;

/// X.509-like certificate for subject identities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    /// Certificate serial number (hex)
    pub serial: String,
    /// Subject URI
    pub subject: String,
    /// Issuer (CA subject URI)
    pub issuer: String,
    /// Subject's public key (SEC1 uncompressed)
    pub public_key: Vec<u8>,
    /// Not valid before (Unix epoch milliseconds)
    pub not_before: u64,
    /// Not valid after (Unix epoch milliseconds)
    pub not_after: u64,
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// Extensions keyed by OID
    #[serde(default)]
    pub extensions: BTreeMap<String, Vec<u8>>,
    /// DER ECDSA signature over [`Certificate::tbs_bytes`]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct TbsCertificate<'a> {
    serial: &'a str,
    subject: &'a str,
    issuer: &'a str,
    public_key: &'a [u8],
    not_before: u64,
    not_after: u64,
    dns_names: &'a [String],
    extensions: &'a BTreeMap<String, Vec<u8>>,
}

impl Certificate {
    /// Bytes covered by the signature.
    pub fn tbs_bytes(&self) -> IdentityResult<Vec<u8>> {
        let tbs = TbsCertificate {
            serial: &self.serial,
            subject: &self.subject,
            issuer: &self.issuer,
            public_key: &self.public_key,
            not_before: self.not_before,
            not_after: self.not_after,
            dns_names: &self.dns_names,
            extensions: &self.extensions,
        };
        Ok(serde_json::to_vec(&tbs)?)
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        self.not_before <= now_ms && now_ms <= self.not_after
    }

    /// Raw embedded claims document, if any.
    pub fn claims_document(&self) -> Option<&[u8]> {
        self.extensions.get(CLAIMS_EXTENSION_OID).map(Vec::as_slice)
    }

    pub fn subject_id(&self) -> IdentityResult<SubjectId> {
        SubjectId::parse(&self.subject)
    }
}

/// Certificate Signing Request with proof of possession.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Public key to be certified (SEC1)
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub dns_names: Vec<String>,
    /// DER ECDSA signature by the matching private key
    pub signature: Vec<u8>,
}

impl CertificateRequest {
    /// Build and sign a request for `signing_key`.
    pub fn new(signing_key: &SigningKey, dns_names: Vec<String>) -> Self {
        let public_key = signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let payload = csr_payload(&public_key, &dns_names);
        let signature: Signature = signing_key.sign(&payload);
        Self {
            public_key,
            dns_names,
            signature: signature.to_der().as_bytes().to_vec(),
        }
    }

    /// Check the proof of possession. Returns the normalized SEC1 key.
    pub fn verify(&self) -> IdentityResult<Vec<u8>> {
        let verifying_key = VerifyingKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| IdentityError::InvalidRequest("CSR public key is not P-256".to_string()))?;
        let signature = Signature::from_der(&self.signature)
            .map_err(|_| IdentityError::InvalidRequest("CSR signature is not DER".to_string()))?;
        verifying_key
            .verify(&csr_payload(&self.public_key, &self.dns_names), &signature)
            .map_err(|_| {
                IdentityError::InvalidRequest("CSR proof of possession failed".to_string())
            })?;
        let key = keys::public_key_from_sec1(&self.public_key)?;
        Ok(keys::sec1_bytes(&key))
    }
}

fn csr_payload(public_key: &[u8], dns_names: &[String]) -> Vec<u8> {
    let mut payload = CSR_CONTEXT.to_vec();
    payload.extend_from_slice(&(public_key.len() as u32).to_be_bytes());
    payload.extend_from_slice(public_key);
    for name in dns_names {
        payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
        payload.extend_from_slice(name.as_bytes());
    }
    payload
}

/// What the CA needs to sign one identity document.
#[derive(Debug, Clone)]
pub struct SvidParams {
    pub subject: SubjectId,
    /// SEC1 public key from a verified CSR
    pub public_key: Vec<u8>,
    pub not_after: u64,
    pub dns_names: Vec<String>,
    pub extensions: BTreeMap<String, Vec<u8>>,
}

/// Signing authority seam.
pub trait CertificateSigner: Send + Sync {
    fn sign_svid(&self, params: SvidParams, now_ms: u64) -> IdentityResult<Certificate>;

    /// Issuer, revocation, validity window and signature.
    fn verify_certificate(&self, cert: &Certificate, now_ms: u64) -> IdentityResult<()>;

    fn ca_certificate(&self) -> &Certificate;
}

/// In-process P-256 certificate authority.
pub struct CertificateAuthority {
    signing_key: SigningKey,
    ca_certificate: Certificate,
    revoked: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_id", &self.ca_certificate.subject)
            .field("serial", &self.ca_certificate.serial)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a CA with a fresh random key.
    pub fn generate(trust_domain: &TrustDomain, validity: Duration) -> IdentityResult<Self> {
        Self::from_signing_key(trust_domain, SigningKey::random(&mut OsRng), validity)
    }

    pub fn from_signing_key(
        trust_domain: &TrustDomain,
        signing_key: SigningKey,
        validity: Duration,
    ) -> IdentityResult<Self> {
        let now = sovereign_core::now_ms();
        let ca_id = format!("spiffe://{trust_domain}");
        let mut ca_certificate = Certificate {
            serial: generate_serial(),
            subject: ca_id.clone(),
            issuer: ca_id.clone(),
            public_key: signing_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            not_before: now,
            not_after: now.saturating_add(validity.as_millis() as u64),
            dns_names: Vec::new(),
            extensions: BTreeMap::new(),
            signature: Vec::new(),
        };
        let signature: Signature = signing_key.sign(&ca_certificate.tbs_bytes()?);
        ca_certificate.signature = signature.to_der().as_bytes().to_vec();

        info!(ca_id = %ca_id, serial = %ca_certificate.serial, "Certificate authority initialized");
        Ok(Self {
            signing_key,
            ca_certificate,
            revoked: RwLock::new(HashSet::new()),
        })
    }

    pub fn ca_id(&self) -> &str {
        &self.ca_certificate.subject
    }

    /// Revoke a certificate.
    pub fn revoke_certificate(&self, serial: &str) -> IdentityResult<()> {
        self.revoked
            .write()
            .map_err(|_| IdentityError::InvalidState("revocation set lock poisoned".to_string()))?
            .insert(serial.to_string());
        Ok(())
    }

    /// Check if a certificate is revoked.
    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked
            .read()
            .map(|revoked| revoked.contains(serial))
            .unwrap_or(true)
    }
}

impl CertificateSigner for CertificateAuthority {
    fn sign_svid(&self, params: SvidParams, now_ms: u64) -> IdentityResult<Certificate> {
        if params.not_after <= now_ms {
            return Err(IdentityError::CertificateAuthority(
                "requested expiry is not in the future".to_string(),
            ));
        }
        let not_after = params.not_after.min(self.ca_certificate.not_after);

        let mut cert = Certificate {
            serial: generate_serial(),
            subject: params.subject.to_string(),
            issuer: self.ca_certificate.subject.clone(),
            public_key: params.public_key,
            not_before: now_ms,
            not_after,
            dns_names: params.dns_names,
            extensions: params.extensions,
            signature: Vec::new(),
        };
        let signature: Signature = self.signing_key.sign(&cert.tbs_bytes()?);
        cert.signature = signature.to_der().as_bytes().to_vec();
        Ok(cert)
    }

    fn verify_certificate(&self, cert: &Certificate, now_ms: u64) -> IdentityResult<()> {
        if cert.issuer != self.ca_certificate.subject {
            return Err(IdentityError::ChainIntegrity(format!(
                "certificate {} was not issued by {}",
                cert.serial, self.ca_certificate.subject
            )));
        }
        if self.is_revoked(&cert.serial) {
            return Err(IdentityError::ChainIntegrity(format!(
                "certificate {} is revoked",
                cert.serial
            )));
        }
        if !cert.is_valid_at(now_ms) {
            return Err(IdentityError::ChainIntegrity(format!(
                "certificate {} is outside its validity window",
                cert.serial
            )));
        }

        let verifying_key = VerifyingKey::from_sec1_bytes(&self.ca_certificate.public_key)
            .map_err(|_| IdentityError::CertificateAuthority("CA key unreadable".to_string()))?;
        let signature = Signature::from_der(&cert.signature).map_err(|_| {
            IdentityError::ChainIntegrity(format!("certificate {} signature malformed", cert.serial))
        })?;
        verifying_key
            .verify(&cert.tbs_bytes()?, &signature)
            .map_err(|_| {
                IdentityError::ChainIntegrity(format!(
                    "certificate {} signature does not verify",
                    cert.serial
                ))
            })
    }

    fn ca_certificate(&self) -> &Certificate {
        &self.ca_certificate
    }
}

/// Verify a lineage chain `[leaf, parent, ...]`.
///
/// Every certificate must verify under `signer`, and each certificate's
/// `grc.inherited-from` must name the next certificate's subject and serial.
pub fn verify_identity_chain(
    chain: &[Certificate],
    signer: &dyn CertificateSigner,
    now_ms: u64,
) -> IdentityResult<()> {
    if chain.is_empty() {
        return Err(IdentityError::ChainIntegrity("empty certificate chain".to_string()));
    }

    for cert in chain {
        signer.verify_certificate(cert, now_ms)?;
    }

    for pair in chain.windows(2) {
        let (child, parent) = (&pair[0], &pair[1]);
        let document = child.claims_document().ok_or_else(|| {
            IdentityError::ChainIntegrity(format!(
                "certificate {} carries no claims document",
                child.serial
            ))
        })?;
        let lineage = ClaimsDocument::from_bytes(document)
            .map_err(|e| IdentityError::ChainIntegrity(e.to_string()))?
            .inherited_from
            .ok_or_else(|| {
                IdentityError::ChainIntegrity(format!(
                    "certificate {} does not reference a parent",
                    child.serial
                ))
            })?;
        if lineage.parent_id.to_string() != parent.subject || lineage.parent_serial != parent.serial
        {
            return Err(IdentityError::ChainIntegrity(format!(
                "certificate {} references {} #{}, chain continues with {} #{}",
                child.serial, lineage.parent_id, lineage.parent_serial, parent.subject, parent.serial
            )));
        }
    }
    Ok(())
}

fn generate_serial() -> String {
    let mut bytes = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
