//! OS-CSPRNG helpers

use rand::rngs::OsRng;
use rand::RngCore;

use crate::aead::AEAD_NONCE_LEN;

/// 96-bit AEAD nonce.
pub fn random_nonce() -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// 128-bit envelope / trust-update nonce.
pub fn random_envelope_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// 256-bit salt.
pub fn random_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_unique() {
        assert_ne!(random_nonce(), random_nonce());
        assert_ne!(random_envelope_nonce(), random_envelope_nonce());
    }

    #[test]
    fn salt_is_non_zero() {
        assert_ne!(random_salt(), [0u8; 32]);
    }
}
