//! Error types for certificate handling.

/// Result type alias for certificate operations.
pub type Result<T> = std::result::Result<T, CertificateError>;

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Malformed certificate: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid key or signature: {0}")]
    InvalidKey(#[from] secp256k1::Error),

    #[error("Signature does not match certificate body")]
    SignatureMismatch,

    #[error("Issuer is not a trusted authority: {0}")]
    UntrustedIssuer(String),

    #[error("Certificate chain exceeds maximum depth of {0}")]
    ChainTooDeep(usize),

    #[error("Intermediate certificate is not an authority: serial {0}")]
    NotAnAuthority(u64),

    #[error("Intermediate certificate is outside its validity period: serial {0}")]
    IntermediateExpired(u64),

    #[error("Validity period is empty: not_before must precede not_after")]
    EmptyValidity,
}
