use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid seed length: expected {expected} bytes, got {actual}")]
    InvalidSeedLength { expected: usize, actual: usize },

    #[error("encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}
