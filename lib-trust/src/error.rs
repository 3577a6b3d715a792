//! Trust protocol error kinds
//!
//! The protocol rejections (`ReplayDrop`, `OutOfOrder`, `ChainBroken`)
//! are counted by callers, never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("duplicate update nonce from issuer")]
    ReplayDrop,

    #[error("out-of-order update: last applied seq {last_seq}, got {got}")]
    OutOfOrder { last_seq: u64, got: u64 },

    #[error("hash chain broken at seq {seq}")]
    ChainBroken { seq: u64 },

    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("issuer trust level too low for this operation")]
    InsufficientTrust,

    #[error("malformed update: {0}")]
    Malformed(String),

    #[error("corrupt trust snapshot: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),
}
