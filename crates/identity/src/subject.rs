//! Subject identifiers within a trust domain.
//!
//! Subjects are named by URIs of the form `spiffe://<trust-domain>/<path>`.
//! Hardware-attested agents get a name derived from a stable hardware fact,
//! selected once per attempt as a [`SubjectDerivation`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{IdentityError, IdentityResult};

/// URI scheme for subject identifiers.
pub const SUBJECT_SCHEME: &str = "spiffe://";

/// Path namespace reserved for attested agents.
pub const AGENT_NAMESPACE: &str = "/agent";

/// Path prefix for agents named from hardware evidence.
pub const UNIFIED_IDENTITY_PREFIX: &str = "/agent/unified_identity";

/// Path prefix for agents attested with a join token.
pub const JOIN_TOKEN_PREFIX: &str = "/agent/join_token";

/// Hex characters of the SHA-256 key fingerprint kept in derived names (128 bits).
pub const FINGERPRINT_HEX_LEN: usize = 32;

/// A trust domain name, e.g. `example.org`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    pub fn new(name: impl Into<String>) -> IdentityResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
            });
        if !valid {
            return Err(IdentityError::InvalidRequest(format!(
                "invalid trust domain {name:?}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TrustDomain> for String {
    fn from(value: TrustDomain) -> Self {
        value.0
    }
}

/// A principal name inside a trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId {
    trust_domain: String,
    path: String,
}

impl SubjectId {
    /// Build a subject from a trust domain and an absolute path.
    pub fn new(trust_domain: &TrustDomain, path: &str) -> IdentityResult<Self> {
        validate_path(path)?;
        Ok(Self {
            trust_domain: trust_domain.as_str().to_string(),
            path: path.to_string(),
        })
    }

    /// Parse a `spiffe://` URI.
    pub fn parse(uri: &str) -> IdentityResult<Self> {
        let rest = uri.strip_prefix(SUBJECT_SCHEME).ok_or_else(|| {
            IdentityError::InvalidRequest(format!("subject {uri:?} lacks the {SUBJECT_SCHEME} scheme"))
        })?;
        let (domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => {
                return Err(IdentityError::InvalidRequest(format!(
                    "subject {uri:?} has no path"
                )))
            }
        };
        let trust_domain = TrustDomain::new(domain)?;
        Self::new(&trust_domain, path)
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        self.trust_domain == trust_domain.as_str()
    }

    /// True for paths under [`AGENT_NAMESPACE`], which only agent
    /// attestation may name.
    pub fn is_agent(&self) -> bool {
        self.path
            .strip_prefix(AGENT_NAMESPACE)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// Subject for an agent attested with a join token.
    pub fn for_join_token(trust_domain: &TrustDomain, token: &str) -> IdentityResult<Self> {
        Self::new(trust_domain, &format!("{JOIN_TOKEN_PREFIX}/{token}"))
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SUBJECT_SCHEME, self.trust_domain, self.path)
    }
}

impl FromStr for SubjectId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubjectId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.to_string()
    }
}

/// How a hardware-attested subject is named. Exactly one variant is chosen
/// per attestation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectDerivation {
    /// Registrar-issued device identifier
    ByExternalId(String),
    /// SEC1 uncompressed encoding of the hardware-resident public key
    ByKeyFingerprint(Vec<u8>),
}

impl SubjectDerivation {
    /// Prefer the registrar identifier; fall back to the key fingerprint.
    pub fn select(registrar_id: Option<&str>, app_key_sec1: &[u8]) -> Self {
        match registrar_id.map(str::trim) {
            Some(id) if !id.is_empty() => SubjectDerivation::ByExternalId(id.to_string()),
            _ => SubjectDerivation::ByKeyFingerprint(app_key_sec1.to_vec()),
        }
    }

    pub fn derive(&self, trust_domain: &TrustDomain) -> IdentityResult<SubjectId> {
        match self {
            SubjectDerivation::ByExternalId(id) => {
                validate_segment(id)?;
                SubjectId::new(trust_domain, &format!("{UNIFIED_IDENTITY_PREFIX}/{id}"))
            }
            SubjectDerivation::ByKeyFingerprint(key) => {
                if key.is_empty() {
                    return Err(IdentityError::InvalidRequest(
                        "cannot fingerprint an empty public key".to_string(),
                    ));
                }
                let fingerprint = key_fingerprint(key);
                SubjectId::new(
                    trust_domain,
                    &format!(
                        "{UNIFIED_IDENTITY_PREFIX}/appkey-{}",
                        &fingerprint[..FINGERPRINT_HEX_LEN]
                    ),
                )
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SubjectDerivation::ByExternalId(_) => "external_id",
            SubjectDerivation::ByKeyFingerprint(_) => "key_fingerprint",
        }
    }
}

/// Full hex SHA-256 of public key bytes.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Check that `segment` can stand alone as one path segment.
pub fn validate_segment(segment: &str) -> IdentityResult<()> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidRequest(format!(
            "invalid path segment {segment:?}"
        )))
    }
}

fn validate_path(path: &str) -> IdentityResult<()> {
    let rest = path.strip_prefix('/').ok_or_else(|| {
        IdentityError::InvalidRequest(format!("subject path {path:?} must start with '/'"))
    })?;
    rest.split('/').try_for_each(validate_segment)
}
