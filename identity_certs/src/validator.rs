//! Certificate validation against a set of trust anchors.

use std::collections::HashSet;
use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};

use crate::certificate::Certificate;
use crate::error::{CertificateError, Result};

/// Maximum number of intermediate authorities walked before giving up.
pub const MAX_CHAIN_DEPTH: usize = 4;

/// Default number of days before `not_after` in which a certificate is reported as expiring soon.
pub const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 14;

/// Classification of a device certificate at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateStatus {
    Valid,
    /// Valid, but `not_after` falls inside the warning window.
    ExpiresSoon,
    Expired,
    /// Signature is fine but `not_before` lies in the future.
    NotActivated,
    /// No certificate was ever issued or fetched for the device.
    NotDownloaded,
    /// Malformed, badly signed or not chained to a trusted anchor.
    Invalid(String),
}

impl CertificateStatus {
    /// Whether a device holding this certificate can be trusted right now.
    pub fn is_trustworthy(&self) -> bool {
        matches!(self, CertificateStatus::Valid | CertificateStatus::ExpiresSoon)
    }
}

impl Display for CertificateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateStatus::Valid => write!(f, "Valid"),
            CertificateStatus::ExpiresSoon => write!(f, "Expires soon"),
            CertificateStatus::Expired => write!(f, "Expired"),
            CertificateStatus::NotActivated => write!(f, "Not activated"),
            CertificateStatus::NotDownloaded => write!(f, "Not downloaded"),
            CertificateStatus::Invalid(reason) => write!(f, "Invalid: {reason}"),
        }
    }
}

/// Pure certificate validator.
///
/// Never fails: malformed input is reported as [`CertificateStatus::Invalid`] so a single bad
/// certificate cannot abort a batch of checks.
#[derive(Clone, Debug)]
pub struct CertificateValidator {
    anchors: HashSet<String>,
    expiry_warning: Duration,
}

impl CertificateValidator {
    /// Create a validator trusting the given hex-encoded authority keys.
    pub fn new<I, S>(anchors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            anchors: anchors
                .into_iter()
                .map(|a| a.into().to_ascii_lowercase())
                .collect(),
            expiry_warning: Duration::days(DEFAULT_EXPIRY_WARNING_DAYS),
        }
    }

    pub fn with_expiry_warning(mut self, window: Duration) -> Self {
        self.expiry_warning = window;
        self
    }

    pub fn add_anchor(&mut self, key_hex: &str) {
        self.anchors.insert(key_hex.to_ascii_lowercase());
    }

    /// `signatureAndChainValid && now < notAfter`.
    pub fn is_trustworthy(&self, raw: &[u8], now: DateTime<Utc>) -> bool {
        self.validate(raw, now).is_trustworthy()
    }

    /// Status of an optional certificate; `None` means it was never downloaded.
    pub fn status(&self, raw: Option<&[u8]>, now: DateTime<Utc>) -> CertificateStatus {
        match raw {
            Some(raw) => self.validate(raw, now),
            None => CertificateStatus::NotDownloaded,
        }
    }

    pub fn validate(&self, raw: &[u8], now: DateTime<Utc>) -> CertificateStatus {
        match Certificate::from_bytes(raw) {
            Ok(cert) => self.validate_certificate(&cert, now),
            Err(e) => CertificateStatus::Invalid(e.to_string()),
        }
    }

    pub fn validate_certificate(&self, cert: &Certificate, now: DateTime<Utc>) -> CertificateStatus {
        if let Err(e) = self.verify_chain(cert, now) {
            return CertificateStatus::Invalid(e.to_string());
        }
        if now < cert.body.not_before {
            CertificateStatus::NotActivated
        } else if now >= cert.body.not_after {
            CertificateStatus::Expired
        } else if now
            .checked_add_signed(self.expiry_warning)
            .map_or(true, |horizon| horizon >= cert.body.not_after)
        {
            // A window reaching past the representable range covers every certificate.
            CertificateStatus::ExpiresSoon
        } else {
            CertificateStatus::Valid
        }
    }

    /// Walk from the leaf through its attached intermediates until a trust anchor signs.
    pub fn verify_chain(&self, cert: &Certificate, now: DateTime<Utc>) -> Result<()> {
        let mut current = cert;
        for _ in 0..=MAX_CHAIN_DEPTH {
            current.verify_signature()?;
            let issuer = current.body.issuer_key.to_ascii_lowercase();
            if self.anchors.contains(&issuer) {
                return Ok(());
            }

            let parent = cert
                .chain
                .iter()
                .find(|c| {
                    c.body
                        .subject_key
                        .as_deref()
                        .is_some_and(|k| k.eq_ignore_ascii_case(&issuer))
                })
                .ok_or(CertificateError::UntrustedIssuer(issuer))?;

            if !parent.body.is_authority {
                return Err(CertificateError::NotAnAuthority(parent.body.serial));
            }
            if !parent.body.is_within_validity(now) {
                return Err(CertificateError::IntermediateExpired(parent.body.serial));
            }
            current = parent;
        }
        Err(CertificateError::ChainTooDeep(MAX_CHAIN_DEPTH))
    }
}
