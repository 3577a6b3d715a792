//! X25519 key agreement

use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::secret::SecretBuffer;
use crate::Result;

pub const X25519_PUBLIC_LEN: usize = 32;
pub const X25519_SHARED_LEN: usize = 32;

/// X25519 key pair built from 32 secret bytes.
pub struct AgreementKeyPair {
    secret: StaticSecret,
}

impl AgreementKeyPair {
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = seed.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: seed.len(),
        })?;
        Ok(Self {
            secret: StaticSecret::from(seed),
        })
    }

    pub fn public_bytes(&self) -> [u8; X25519_PUBLIC_LEN] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Diffie-Hellman against a peer public key.
    ///
    /// Rejects the all-zero (non-contributory) output so a malicious
    /// low-order public key cannot force a known shared secret.
    pub fn agree(&self, peer_public: &[u8]) -> Result<SecretBuffer> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_PUBLIC_LEN,
                actual: peer_public.len(),
            })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        Ok(SecretBuffer::from_slice(shared.as_bytes()))
    }
}

impl std::fmt::Debug for AgreementKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgreementKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish()
    }
}

/// One-shot agreement from raw secret bytes.
pub fn agree(local_secret: &[u8], peer_public: &[u8]) -> Result<SecretBuffer> {
    AgreementKeyPair::from_seed(local_secret)?.agree(peer_public)
}
