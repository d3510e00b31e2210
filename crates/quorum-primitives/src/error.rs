//! error types for quorum primitives

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    // === filter errors ===
    #[error("invalid filter parameters: {0}")]
    InvalidFilterParams(String),

    #[error("malformed filter encoding: {0}")]
    MalformedFilter(String),

    #[error("unsupported filter format: version {version}, hash scheme {scheme}")]
    UnsupportedFilterFormat { version: u8, scheme: u8 },

    #[error("filter parameter mismatch: expected {expected}, found {found}")]
    FilterMismatch { expected: String, found: String },

    #[error("canonical encoding failed: {0}")]
    Encoding(String),
}
