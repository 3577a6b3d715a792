//! Zeroizing secret container
//!
//! `SecretBuffer` is the only way key material moves between components.
//! It is uniquely owned, cannot be cloned, never prints its contents, and
//! wipes on every exit path including panic unwind (drop runs either way).

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

pub struct SecretBuffer {
    bytes: Vec<u8>,
}

impl SecretBuffer {
    /// Zero-filled buffer of `len` bytes, for callers that fill in place.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
        }
    }

    /// Take ownership of an existing vector. The source is moved, not
    /// copied, so no stray plaintext copy survives.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Scoped read access. The borrow cannot escape the closure.
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes)
    }

    /// Scoped mutable access, for in-place derivation.
    pub fn expose_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes)
    }

    /// Constant-time equality against another byte slice.
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        self.bytes.ct_eq(other).into()
    }

    /// Explicit early wipe; the buffer becomes empty.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
        self.bytes.clear();
        self.bytes.shrink_to_fit();
    }

    /// True once `wipe` has run (or the buffer was created empty).
    pub fn is_wiped(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl Zeroize for SecretBuffer {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBuffer({} bytes)", self.bytes.len())
    }
}
