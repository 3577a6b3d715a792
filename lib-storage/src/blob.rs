//! Encrypted blob layout
//!
//! Every stored object is `magic "HSB1" || version u8 || nonce [12] ||
//! ciphertext+tag`. The AEAD associated data binds the blob to its slot
//! (file name, kv key hash, log stream) so blobs cannot be swapped
//! between slots undetected.

use lib_crypto::{aead, random_nonce, SecretBuffer};

use crate::error::StorageError;
use crate::Result;

const MAGIC: &[u8; 4] = b"HSB1";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + aead::AEAD_NONCE_LEN;

/// Seal `plaintext` into a self-describing blob.
pub fn seal(key: &SecretBuffer, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    let nonce = random_nonce();
    let ciphertext = key.expose(|k| aead::seal(k, &nonce, plaintext, associated_data))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(MAGIC);
    blob.push(VERSION);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by `seal`. Header or tag failure is `Corrupt`.
pub fn open(key: &SecretBuffer, blob: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < HEADER_LEN + aead::AEAD_TAG_LEN {
        return Err(StorageError::Corrupt("blob too short".into()));
    }
    if &blob[..4] != MAGIC {
        return Err(StorageError::Corrupt("bad blob magic".into()));
    }
    if blob[4] != VERSION {
        return Err(StorageError::Corrupt(format!("unknown blob version {}", blob[4])));
    }
    let nonce = &blob[5..5 + aead::AEAD_NONCE_LEN];
    let ciphertext = &blob[HEADER_LEN..];

    key.expose(|k| aead::open(k, nonce, ciphertext, associated_data))
        .map_err(|_| StorageError::Corrupt("blob authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::random_bytes;

    #[test]
    fn seal_open_roundtrip() {
        let key = SecretBuffer::from_vec(random_bytes(32));
        let blob = seal(&key, b"payload", b"slot").unwrap();
        assert_eq!(open(&key, &blob, b"slot").unwrap(), b"payload");
    }

    #[test]
    fn slot_binding_is_enforced() {
        let key = SecretBuffer::from_vec(random_bytes(32));
        let blob = seal(&key, b"payload", b"slot-a").unwrap();
        assert!(matches!(
            open(&key, &blob, b"slot-b").unwrap_err(),
            StorageError::Corrupt(_)
        ));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let key = SecretBuffer::from_vec(random_bytes(32));
        let blob = seal(&key, b"payload", b"slot").unwrap();
        assert!(open(&key, &blob[..10], b"slot").is_err());
    }
}
