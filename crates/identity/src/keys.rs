//! P-256 public key encodings.
//!
//! Hardware app keys arrive as PEM SubjectPublicKeyInfo or base64 SEC1.
//! Everything downstream works on the SEC1 uncompressed form so identical
//! keys always compare and hash identically.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::PublicKey;

use crate::error::{IdentityError, IdentityResult};

const PEM_MARKER: &str = "-----BEGIN PUBLIC KEY-----";

/// Parse a PEM SPKI or base64 SEC1 public key.
pub fn decode_public_key(encoded: &str) -> IdentityResult<PublicKey> {
    let trimmed = encoded.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::InvalidRequest(
            "public key is required".to_string(),
        ));
    }

    if trimmed.starts_with(PEM_MARKER) {
        return PublicKey::from_public_key_pem(trimmed).map_err(|e| {
            IdentityError::InvalidRequest(format!("public key is not a P-256 PEM key: {e}"))
        });
    }

    let bytes = BASE64.decode(trimmed).map_err(|e| {
        IdentityError::InvalidRequest(format!("public key is neither PEM nor base64: {e}"))
    })?;
    public_key_from_sec1(&bytes)
        .map_err(|_| IdentityError::InvalidRequest("public key is not a P-256 point".to_string()))
}

/// Parse SEC1 bytes (compressed or uncompressed).
pub fn public_key_from_sec1(bytes: &[u8]) -> IdentityResult<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| IdentityError::InvalidRequest("invalid SEC1 public key".to_string()))
}

/// SEC1 uncompressed encoding.
pub fn sec1_bytes(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

/// PEM SubjectPublicKeyInfo with LF line endings.
pub fn public_key_pem(key: &PublicKey) -> IdentityResult<String> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Composition(format!("cannot encode public key as PEM: {e}")))
}
