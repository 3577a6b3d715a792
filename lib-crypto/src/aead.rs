//! ChaCha20-Poly1305 authenticated encryption
//!
//! Callers supply the 96-bit nonce explicitly; nonce discipline (random
//! per-blob, or generation||counter for channels) lives with the caller.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;
use crate::Result;

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305> {
    if key.len() != AEAD_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: AEAD_KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(ChaCha20Poly1305::new(Key::from_slice(key)))
}

/// Seal `plaintext` under `key`/`nonce`, binding `associated_data`.
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != AEAD_NONCE_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: AEAD_NONCE_LEN,
            actual: nonce.len(),
        });
    }
    cipher(key)?
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AeadTagMismatch)
}

/// Open a sealed blob. Any mismatch in key, nonce, associated data,
/// ciphertext or tag yields `AeadTagMismatch` with no partial output.
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != AEAD_NONCE_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: AEAD_NONCE_LEN,
            actual: nonce.len(),
        });
    }
    cipher(key)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::AeadTagMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{random_bytes, random_nonce};

    #[test]
    fn seal_open_roundtrip() {
        let key = random_bytes(32);
        let nonce = random_nonce();
        let plaintext = b"haven aead test payload";
        let ad = b"header";

        let sealed = seal(&key, &nonce, plaintext, ad).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + AEAD_TAG_LEN);

        let opened = open(&key, &nonce, &sealed, ad).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampering_any_input_fails() {
        let key = random_bytes(32);
        let nonce = random_nonce();
        let sealed = seal(&key, &nonce, b"payload", b"ad").unwrap();

        // Wrong key
        let other_key = random_bytes(32);
        assert!(open(&other_key, &nonce, &sealed, b"ad").is_err());

        // Wrong nonce
        let other_nonce = random_nonce();
        assert!(open(&key, &other_nonce, &sealed, b"ad").is_err());

        // Wrong associated data
        assert!(open(&key, &nonce, &sealed, b"other").is_err());

        // Flipped ciphertext bit
        let mut corrupt = sealed.clone();
        corrupt[0] ^= 1;
        assert!(open(&key, &nonce, &corrupt, b"ad").is_err());

        // Flipped tag bit
        let mut corrupt = sealed;
        let last = corrupt.len() - 1;
        corrupt[last] ^= 1;
        assert!(matches!(
            open(&key, &nonce, &corrupt, b"ad").unwrap_err(),
            CryptoError::AeadTagMismatch
        ));
    }

    #[test]
    fn rejects_short_key() {
        assert!(seal(&[0u8; 16], &[0u8; 12], b"x", b"").is_err());
    }
}
