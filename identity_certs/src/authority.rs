//! Certificate issuance.

use chrono::{DateTime, Utc};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::certificate::{encode_public_key, Certificate, CertificateBody};
use crate::error::{CertificateError, Result};

/// Signing authority for device certificates.
///
/// A root authority has an empty chain. An intermediate authority carries its own
/// certificate (and the chain above it), which is attached to every certificate it issues.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    secret: SecretKey,
    public: PublicKey,
    chain: Vec<Certificate>,
    next_serial: u64,
}

impl CertificateAuthority {
    /// Create a root authority with a fresh random key pair.
    pub fn generate() -> Self {
        let (secret, public) = SECP256K1.generate_keypair(&mut rand::thread_rng());
        Self {
            secret,
            public,
            chain: Vec::new(),
            next_serial: 1,
        }
    }

    /// Restore a root authority from a hex-encoded secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let secret = SecretKey::from_slice(&hex::decode(secret.trim())?)?;
        Ok(Self {
            public: PublicKey::from_secret_key_global(&secret),
            secret,
            chain: Vec::new(),
            next_serial: 1,
        })
    }

    /// Hex-encoded compressed public key, as stored in trust anchors.
    pub fn public_key_hex(&self) -> String {
        encode_public_key(&self.public)
    }

    /// Issue a leaf certificate binding `device` to `user`.
    pub fn issue_device(
        &mut self,
        device: &str,
        user: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Certificate> {
        let body = CertificateBody {
            serial: self.take_serial(),
            subject_device: device.to_string(),
            subject_user: user.to_string(),
            issuer_key: self.public_key_hex(),
            subject_key: None,
            is_authority: false,
            not_before,
            not_after,
        };
        self.sign(body)
    }

    /// Issue an intermediate authority signed by this one.
    pub fn issue_intermediate(
        &mut self,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<CertificateAuthority> {
        let (secret, public) = SECP256K1.generate_keypair(&mut rand::thread_rng());
        let body = CertificateBody {
            serial: self.take_serial(),
            subject_device: String::new(),
            subject_user: String::new(),
            issuer_key: self.public_key_hex(),
            subject_key: Some(encode_public_key(&public)),
            is_authority: true,
            not_before,
            not_after,
        };
        let own = self.sign(body)?;

        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Certificate {
            chain: Vec::new(),
            ..own
        });
        chain.extend(self.chain.iter().cloned());

        Ok(CertificateAuthority {
            secret,
            public,
            chain,
            next_serial: 1,
        })
    }

    fn sign(&self, body: CertificateBody) -> Result<Certificate> {
        if body.not_before >= body.not_after {
            return Err(CertificateError::EmptyValidity);
        }
        let message = Message::from_digest(body.digest()?);
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret);
        Ok(Certificate {
            body,
            signature: hex::encode(signature.serialize_compact()),
            chain: self.chain.clone(),
        })
    }

    fn take_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }
}
