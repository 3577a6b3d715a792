//! Haven cryptography foundation
//!
//! Standard primitives only: Ed25519 signing, X25519 key agreement,
//! ChaCha20-Poly1305 AEAD, HKDF-SHA-512, scrypt, BLAKE2b and BIP-39
//! mnemonics. Everything operates on byte slices and returns a distinct
//! error kind on verification failure.

pub mod aead;
pub mod error;
pub mod exchange;
pub mod hashing;
pub mod kdf;
pub mod mnemonic;
pub mod random;
pub mod secret;
pub mod signing;

pub use bip39::Mnemonic;

pub use aead::{open, seal, AEAD_KEY_LEN, AEAD_NONCE_LEN, AEAD_TAG_LEN};
pub use error::CryptoError;
pub use exchange::{agree, AgreementKeyPair};
pub use hashing::{blake2b_256, blake2b_256_parts, blake2b_512};
pub use kdf::{derive_key, derive_master_key, ScryptParams};
pub use mnemonic::{generate_mnemonic, mnemonic_to_seed, parse_mnemonic};
pub use random::{random_bytes, random_envelope_nonce, random_nonce, random_salt};
pub use secret::SecretBuffer;
pub use signing::{sign_detached, verify_detached, SigningKeyPair};

/// Shorthand result type used across the crate.
pub type Result<T> = std::result::Result<T, CryptoError>;
