//! Haven key vault
//!
//! Owns the master key, the sealed seed and every sub-key derivation.
//! Secrets leave this crate only as scoped `SecretBuffer` loans or as
//! public key halves.

pub mod error;
pub mod identity;
pub mod vault;

pub use error::VaultError;
pub use identity::NodeIdentity;
pub use vault::{KeyVault, SubKeyPurpose};

pub type Result<T> = std::result::Result<T, VaultError>;
