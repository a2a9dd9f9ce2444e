//! Access token signature verification against a published key set.
//!
//! Only EdDSA over Ed25519 is accepted. The algorithm named in the token
//! header is checked against that allow-list before any key lookup, so a
//! token claiming `none` or an HMAC algorithm is rejected by name.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, KeyAlgorithm, OctetKeyPairParameters,
    OctetKeyPairType, PublicKeyUse,
};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::types::VerifyError;

pub use jsonwebtoken::jwk::Jwk;

/// A JWKS document: `{"keys": [...]}`.
pub type KeySet = jsonwebtoken::jwk::JwkSet;

/// The one signing algorithm we trust.
pub const SUPPORTED_ALGORITHM: &str = "EdDSA";

const ED25519_KEY_LEN: usize = 32;

/// Describe an Ed25519 public key as a JWK.
pub fn ed25519_jwk(kid: &str, key: &VerifyingKey) -> Jwk {
    Jwk {
        common: CommonParameters {
            public_key_use: Some(PublicKeyUse::Signature),
            key_algorithm: Some(KeyAlgorithm::EdDSA),
            key_id: Some(kid.to_string()),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::OctetKeyPair(OctetKeyPairParameters {
            key_type: OctetKeyPairType::OctetKeyPair,
            curve: EllipticCurve::Ed25519,
            x: URL_SAFE_NO_PAD.encode(key.as_bytes()),
        }),
    }
}

/// The Ed25519 public key published under `kid`, if any.
fn find_ed25519<'a>(keys: &'a KeySet, kid: &str) -> Option<&'a OctetKeyPairParameters> {
    keys.keys.iter().find_map(|jwk| match &jwk.algorithm {
        AlgorithmParameters::OctetKeyPair(params)
            if jwk.common.key_id.as_deref() == Some(kid)
                && params.curve == EllipticCurve::Ed25519 =>
        {
            Some(params)
        }
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
}

/// The claims we read from a verified token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl Claims {
    /// Expiry, if the token carries a usable `exp`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp?, 0)
    }
}

/// Verify `token` against `keys` and return its claims.
pub fn verify_token(token: &str, keys: &KeySet) -> Result<Claims, VerifyError> {
    let header_b64 = header_segment(token)?;

    // Read alg from the raw header so unknown names like "none" are reported
    // as such instead of as a parse failure.
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64.trim_end_matches('='))
        .map_err(|e| VerifyError::Malformed(format!("header is not base64url: {}", e)))?;
    let raw: RawHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| VerifyError::Malformed(format!("header is not JSON: {}", e)))?;
    if raw.alg != SUPPORTED_ALGORITHM {
        return Err(VerifyError::UnsupportedAlgorithm(raw.alg));
    }

    let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let kid = header.kid.unwrap_or_default();
    let params = find_ed25519(keys, &kid).ok_or_else(|| VerifyError::KeyNotFound(kid.clone()))?;

    let x = URL_SAFE_NO_PAD
        .decode(params.x.trim_end_matches('='))
        .map_err(|e| VerifyError::InvalidKey(format!("x is not base64url: {}", e)))?;
    if x.len() != ED25519_KEY_LEN {
        return Err(VerifyError::InvalidKey(format!(
            "expected {} bytes, got {}",
            ED25519_KEY_LEN,
            x.len()
        )));
    }
    let key = DecodingKey::from_ed_components(&params.x)
        .map_err(|e| VerifyError::InvalidKey(e.to_string()))?;

    let data = decode::<Claims>(token, &key, &validation()).map_err(|e| match e.kind() {
        ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
        ErrorKind::InvalidKeyFormat => {
            VerifyError::InvalidKey(e.to_string())
        }
        _ => VerifyError::Malformed(e.to_string()),
    })?;

    Ok(data.claims)
}

/// Signature-only validation. Expiry is read from the claims by the caller,
/// and tokens without `exp` are accepted.
fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation
}

fn header_segment(token: &str) -> Result<&str, VerifyError> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(_), Some(s), None) if !h.is_empty() && !s.is_empty() => Ok(h),
        _ => Err(VerifyError::Malformed(
            "token must have three dot-separated segments".into(),
        )),
    }
}
