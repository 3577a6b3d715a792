//! Key derivation: HKDF-SHA-512 and scrypt
//!
//! HKDF covers deterministic sub-key derivation; scrypt covers the
//! password-to-master-key path.

use hkdf::Hkdf;
use sha2::Sha512;

use crate::error::CryptoError;
use crate::secret::SecretBuffer;
use crate::Result;

/// scrypt cost parameters. The floor is `N = 2^15, r = 8, p = 1`;
/// attempts to configure below the floor are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

impl ScryptParams {
    pub fn validate(&self) -> Result<()> {
        if self.log_n < 15 {
            return Err(CryptoError::Kdf("scrypt log_n below minimum of 15"));
        }
        if self.r == 0 || self.p == 0 {
            return Err(CryptoError::Kdf("scrypt r and p must be nonzero"));
        }
        Ok(())
    }
}

/// HKDF-Extract-and-Expand with SHA-512.
pub fn derive_key(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], len: usize) -> Result<SecretBuffer> {
    let hk = Hkdf::<Sha512>::new(salt, ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::Kdf("HKDF expand length out of range"))?;
    Ok(SecretBuffer::from_vec(okm))
}

/// Derive a 32-byte master key from a password and per-user salt.
pub fn derive_master_key(password: &[u8], salt: &[u8], params: ScryptParams) -> Result<SecretBuffer> {
    params.validate()?;
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, 32)
        .map_err(|_| CryptoError::Kdf("invalid scrypt parameters"))?;

    let mut out = vec![0u8; 32];
    scrypt::scrypt(password, salt, &scrypt_params, &mut out)
        .map_err(|_| CryptoError::Kdf("scrypt output length invalid"))?;
    Ok(SecretBuffer::from_vec(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_purpose_separated() {
        let seed = [42u8; 64];
        let a = derive_key(Some(b"salt"), &seed, b"identity", 32).unwrap();
        let b = derive_key(Some(b"salt"), &seed, b"identity", 32).unwrap();
        let c = derive_key(Some(b"salt"), &seed, b"ecdh", 32).unwrap();

        a.expose(|x| b.expose(|y| assert_eq!(x, y)));
        a.expose(|x| c.expose(|y| assert_ne!(x, y)));
    }

    #[test]
    fn scrypt_floor_enforced() {
        let weak = ScryptParams {
            log_n: 10,
            r: 8,
            p: 1,
        };
        assert!(derive_master_key(b"pw", b"salt", weak).is_err());
    }

    // scrypt at production cost is slow in debug builds; one vector is enough.
    #[test]
    fn master_key_deterministic() {
        let params = ScryptParams::default();
        let a = derive_master_key(b"correct horse battery staple", b"salt-32-bytes", params).unwrap();
        let b = derive_master_key(b"correct horse battery staple", b"salt-32-bytes", params).unwrap();
        let c = derive_master_key(b"wrong password", b"salt-32-bytes", params).unwrap();

        a.expose(|x| b.expose(|y| assert_eq!(x, y)));
        a.expose(|x| c.expose(|y| assert_ne!(x, y)));
    }
}
