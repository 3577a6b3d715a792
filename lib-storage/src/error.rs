//! Storage error kinds

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object exceeds size limit: {actual} > {limit} bytes")]
    SizeLimit { limit: usize, actual: usize },

    /// Decrypted-but-invalid or unopenable state. The caller decides
    /// whether to fall back to an older snapshot.
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
