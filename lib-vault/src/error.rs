//! Vault error kinds

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Required file absent or unreadable. Fatal at startup.
    #[error("missing vault file: {0}")]
    ConfigMissing(String),

    /// Wrong password (the sealed seed failed to open). Never retried
    /// automatically; lockout accounting lives in the control surface.
    #[error("authentication failed")]
    AuthFailure,

    #[error("vault is locked")]
    Locked,

    #[error("vault already initialized")]
    AlreadyInitialized,

    #[error("vault not initialized")]
    NotInitialized,

    #[error("corrupt vault file: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
