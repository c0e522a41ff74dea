//! Certificate blob format.
//!
//! A certificate is a JSON document holding the signed [`CertificateBody`], its secp256k1
//! ECDSA signature and the intermediate authority certificates needed to reach a trust anchor.

use chrono::{DateTime, Utc};
use secp256k1::{
    ecdsa::Signature,
    hashes::{sha256, Hash},
    Message, PublicKey, SECP256K1,
};
use serde::{Deserialize, Serialize};

use crate::error::{CertificateError, Result};

/// Signed part of a certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub serial: u64,
    /// Device the certificate is bound to. Empty for authority certificates.
    pub subject_device: String,
    /// User owning the device. Empty for authority certificates.
    pub subject_user: String,
    /// Hex-encoded compressed public key of the issuer.
    pub issuer_key: String,
    /// Hex-encoded compressed public key certified by this body (authorities only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_key: Option<String>,
    #[serde(default)]
    pub is_authority: bool,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateBody {
    /// SHA-256 digest of the canonical JSON encoding, as signed by the issuer.
    pub fn digest(&self) -> Result<[u8; 32]> {
        let encoded = serde_json::to_vec(self)?;
        Ok(sha256::Hash::hash(&encoded).to_byte_array())
    }

    /// Whether `now` lies inside `[not_before, not_after)`.
    pub fn is_within_validity(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub body: CertificateBody,
    /// Hex-encoded compact ECDSA signature over [`CertificateBody::digest`].
    pub signature: String,
    /// Intermediate authorities, leaf-side first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<Certificate>,
}

impl Certificate {
    /// Parse a certificate blob.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Encode the certificate as a blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn issuer_key(&self) -> Result<PublicKey> {
        parse_public_key(&self.body.issuer_key)
    }

    /// Check the signature against the issuer key named in the body.
    pub fn verify_signature(&self) -> Result<()> {
        let issuer = self.issuer_key()?;
        let signature = Signature::from_compact(&hex::decode(&self.signature)?)?;
        let message = Message::from_digest(self.body.digest()?);
        SECP256K1
            .verify_ecdsa(&message, &signature, &issuer)
            .map_err(|_| CertificateError::SignatureMismatch)
    }

    /// Whether this certificate is bound to the given device of the given user.
    pub fn is_bound_to(&self, device: &str, user: &str) -> bool {
        !self.body.is_authority && self.body.subject_device == device && self.body.subject_user == user
    }
}

pub(crate) fn parse_public_key(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from_slice(&hex::decode(encoded)?)?)
}

pub(crate) fn encode_public_key(key: &PublicKey) -> String {
    hex::encode(key.serialize())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::CertificateAuthority;

    #[test]
    fn blob_roundtrip_preserves_signature() {
        let mut ca = CertificateAuthority::generate();
        let now = Utc::now();
        let cert = ca
            .issue_device("device-1", "alice@example.com", now, now + Duration::days(90))
            .unwrap();

        let parsed = Certificate::from_bytes(&cert.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, cert);
        assert!(parsed.verify_signature().is_ok());
    }

    #[test]
    fn tampered_body_fails_signature() {
        let mut ca = CertificateAuthority::generate();
        let now = Utc::now();
        let mut cert = ca
            .issue_device("device-1", "alice@example.com", now, now + Duration::days(1))
            .unwrap();
        cert.body.not_after = now + Duration::days(3650);

        assert!(matches!(
            cert.verify_signature(),
            Err(CertificateError::SignatureMismatch)
        ));
    }

    #[test]
    fn malformed_blob_is_an_error() {
        assert!(matches!(
            Certificate::from_bytes(b"-----BEGIN CERTIFICATE-----"),
            Err(CertificateError::Malformed(_))
        ));
    }

    #[test]
    fn binding_checks_device_and_user() {
        let mut ca = CertificateAuthority::generate();
        let now = Utc::now();
        let cert = ca
            .issue_device("device-1", "alice@example.com", now, now + Duration::days(1))
            .unwrap();

        assert!(cert.is_bound_to("device-1", "alice@example.com"));
        assert!(!cert.is_bound_to("device-1", "bob@example.com"));
        assert!(!cert.is_bound_to("device-2", "alice@example.com"));
    }
}
