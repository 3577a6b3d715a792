//! BLAKE2b hashing

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b-256 digest.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-512 digest.
pub fn blake2b_512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-256 over several segments without concatenating.
pub fn blake2b_256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        assert_eq!(blake2b_256(b"haven"), blake2b_256(b"haven"));
        assert_ne!(blake2b_256(b"haven"), blake2b_256(b"havem"));
    }

    #[test]
    fn parts_match_concatenation() {
        assert_eq!(
            blake2b_256_parts(&[b"ha", b"ven"]),
            blake2b_256(b"haven")
        );
    }

    #[test]
    fn lengths() {
        assert_eq!(blake2b_256(b"x").len(), 32);
        assert_eq!(blake2b_512(b"x").len(), 64);
    }
}
