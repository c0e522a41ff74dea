//! Device identity certificates.
//!
//! - [`Certificate`] - signed binding of a device to its owning user
//! - [`CertificateAuthority`] - issues device and intermediate certificates
//! - [`CertificateValidator`] - decides whether a certificate is trustworthy now
//!
//! # Quick Start
//!
//! ```ignore
//! use identity_certs::{CertificateAuthority, CertificateValidator};
//!
//! let mut ca = CertificateAuthority::generate();
//! let cert = ca.issue_device("device-1", "alice@example.com", not_before, not_after)?;
//!
//! let validator = CertificateValidator::new([ca.public_key_hex()]);
//! assert!(validator.is_trustworthy(&cert.to_bytes()?, Utc::now()));
//! ```

mod authority;
mod certificate;
pub mod error;
mod validator;

pub use authority::CertificateAuthority;
pub use certificate::{Certificate, CertificateBody};
pub use error::{CertificateError, Result};
pub use validator::{
    CertificateStatus, CertificateValidator, DEFAULT_EXPIRY_WARNING_DAYS, MAX_CHAIN_DEPTH,
};
