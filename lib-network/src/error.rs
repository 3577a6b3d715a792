//! Network layer error kinds
//!
//! Router and channel rejections (`ReplayDrop`, `TtlExpired`,
//! `RoutingLoop`, `NoRoute`) are counted by the caller, never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("replayed frame or envelope dropped")]
    ReplayDrop,

    #[error("TTL expired")]
    TtlExpired,

    #[error("routing loop detected at {0}")]
    RoutingLoop(String),

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("operation timed out")]
    Timeout,

    #[error("payload exceeds size limit: {actual} > {limit} bytes")]
    SizeLimit { limit: usize, actual: usize },

    #[error("no open channel to {0}")]
    ChannelNotOpen(String),

    #[error("channel to {0} is closed")]
    ChannelClosed(String),

    #[error("peer {0} below required trust level")]
    InsufficientTrust(String),

    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("peer {0} not connected")]
    NotConnected(String),

    #[error("malformed wire data: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] lib_crypto::CryptoError),

    #[error(transparent)]
    Trust(#[from] lib_trust::TrustError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
