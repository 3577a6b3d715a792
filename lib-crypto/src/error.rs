//! Crypto error kinds
//!
//! Every verification mismatch maps to its own variant so callers can
//! count and classify failures without string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("AEAD authentication tag mismatch")]
    AeadTagMismatch,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid public key encoding")]
    InvalidPublicKey,

    #[error("X25519 produced a non-contributory shared secret")]
    WeakSharedSecret,

    #[error("key derivation failed: {0}")]
    Kdf(&'static str),

    #[error("invalid mnemonic phrase: {0}")]
    Mnemonic(String),

    #[error("unsupported mnemonic word count: {0}")]
    MnemonicWordCount(usize),
}
