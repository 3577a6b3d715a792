//! Ed25519 signing and detached verification

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CryptoError;
use crate::Result;

pub const ED25519_PUBLIC_LEN: usize = 32;
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Ed25519 key pair derived from a 32-byte seed.
///
/// The secret half is wiped on drop; the public half is freely copyable.
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Build a key pair deterministically from 32 seed bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = seed.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: seed.len(),
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_bytes(&self) -> [u8; ED25519_PUBLIC_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish()
    }
}

/// Sign `message` with a raw 32-byte seed without keeping the pair around.
pub fn sign_detached(seed: &[u8], message: &[u8]) -> Result<[u8; ED25519_SIGNATURE_LEN]> {
    let pair = SigningKeyPair::from_seed(seed)?;
    Ok(pair.sign(message))
}

/// Verify a detached signature against a 32-byte Ed25519 public key.
pub fn verify_detached(public: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let public: [u8; 32] = public.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: ED25519_PUBLIC_LEN,
        actual: public.len(),
    })?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: ED25519_SIGNATURE_LEN,
            actual: signature.len(),
        })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(&signature);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let pair = SigningKeyPair::from_seed(&[7u8; 32]).unwrap();
        let message = b"haven signing test";
        let sig = pair.sign(message);

        verify_detached(&pair.public_bytes(), message, &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let pair = SigningKeyPair::from_seed(&[7u8; 32]).unwrap();
        let sig = pair.sign(b"original");

        let err = verify_detached(&pair.public_bytes(), b"altered", &sig).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureMismatch));
    }

    #[test]
    fn deterministic_from_seed() {
        let a = SigningKeyPair::from_seed(&[9u8; 32]).unwrap();
        let b = SigningKeyPair::from_seed(&[9u8; 32]).unwrap();
        assert_eq!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn rejects_bad_seed_length() {
        assert!(SigningKeyPair::from_seed(&[1u8; 16]).is_err());
    }
}
