//! Haven trust store and sync protocol
//!
//! The trust store is the canonical set of peer records. Changes travel
//! as signed, sequenced, hash-chained `TrustUpdate`s; ingest enforces
//! replay, ordering and chain-link checks before anything is applied.

pub mod error;
pub mod peer;
pub mod store;
pub mod update;

pub use error::TrustError;
pub use peer::{PeerId, TrustLevel, TrustPeer};
pub use store::{TrustSnapshot, TrustStore};
pub use update::{TrustOp, TrustUpdate};

pub type Result<T> = std::result::Result<T, TrustError>;
