//! Key vault: master key, sealed seed, sub-key derivation
//!
//! On-disk layout under the env directory:
//!   master.salt  32 random bytes, created once at first boot
//!   seed.enc     AEAD-sealed 64-byte seed under a master-key wrapping key
//!
//! The master key is derived per unlock and never persisted. The seed is
//! resident only while the vault is unlocked and is wiped on `lock`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zeroize::Zeroize;

use lib_crypto::{
    aead, blake2b_256, derive_key, derive_master_key, generate_mnemonic, mnemonic_to_seed,
    parse_mnemonic, random_nonce, random_salt, Mnemonic, ScryptParams, SecretBuffer,
};

use crate::error::VaultError;
use crate::identity::NodeIdentity;
use crate::Result;

const SALT_FILE: &str = "master.salt";
const SEED_FILE: &str = "seed.enc";

const SEED_MAGIC: &[u8; 4] = b"HSE1";
const SEED_AAD: &[u8] = b"haven.seed.v1";
const SEED_WRAP_INFO: &[u8] = b"seed-wrap";

/// Well-known sub-key purposes. Arbitrary labels are allowed through
/// `derive_subkey_raw`; these cover the kernel's own needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKeyPurpose {
    Identity,
    Ecdh,
    Storage,
    ApiToken,
}

impl SubKeyPurpose {
    pub fn label(&self) -> &'static [u8] {
        match self {
            SubKeyPurpose::Identity => b"identity",
            SubKeyPurpose::Ecdh => b"ecdh",
            SubKeyPurpose::Storage => b"storage",
            SubKeyPurpose::ApiToken => b"api-token",
        }
    }
}

struct UnlockedState {
    master_key: SecretBuffer,
    seed: SecretBuffer,
}

impl Drop for UnlockedState {
    fn drop(&mut self) {
        self.master_key.wipe();
        self.seed.wipe();
    }
}

pub struct KeyVault {
    env_dir: PathBuf,
    scrypt: ScryptParams,
    unlocked: Option<UnlockedState>,
}

impl KeyVault {
    pub fn new(env_dir: impl Into<PathBuf>, scrypt: ScryptParams) -> Self {
        Self {
            env_dir: env_dir.into(),
            scrypt,
            unlocked: None,
        }
    }

    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    pub fn is_initialized(&self) -> bool {
        self.env_dir.join(SEED_FILE).exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.is_some()
    }

    /// First boot: generate a mnemonic, seal its seed under the password
    /// and return the phrase exactly once for the owner to record.
    pub fn initialize(&mut self, password: &str, word_count: usize) -> Result<Mnemonic> {
        let mnemonic = generate_mnemonic(word_count)?;
        self.initialize_with(password, &mnemonic)?;
        Ok(mnemonic)
    }

    /// Recovery path: rebuild the vault from an existing phrase.
    pub fn initialize_from_phrase(&mut self, password: &str, phrase: &str) -> Result<()> {
        let mnemonic = parse_mnemonic(phrase)?;
        self.initialize_with(password, &mnemonic)
    }

    fn initialize_with(&mut self, password: &str, mnemonic: &Mnemonic) -> Result<()> {
        if self.is_initialized() {
            return Err(VaultError::AlreadyInitialized);
        }
        fs::create_dir_all(&self.env_dir)?;

        let salt = random_salt();
        write_restricted(&self.env_dir.join(SALT_FILE), &salt)?;

        let master_key = derive_master_key(password.as_bytes(), &salt, self.scrypt)?;
        let seed = mnemonic_to_seed(mnemonic);
        let sealed = seal_seed(&master_key, &seed)?;
        write_restricted(&self.env_dir.join(SEED_FILE), &sealed)?;

        self.unlocked = Some(UnlockedState { master_key, seed });
        info!(env_dir = %self.env_dir.display(), "vault initialized");
        Ok(())
    }

    /// Unlock with the owner password. A wrong password surfaces as
    /// `AuthFailure` (the sealed seed fails to open); the vault keeps no
    /// retry counter.
    pub fn unlock(&mut self, password: &str) -> Result<()> {
        if !self.is_initialized() {
            return Err(VaultError::NotInitialized);
        }
        let salt = self.read_salt()?;
        let master_key = derive_master_key(password.as_bytes(), &salt, self.scrypt)?;

        let sealed = fs::read(self.env_dir.join(SEED_FILE))?;
        let seed = open_seed(&master_key, &sealed)?;

        self.unlocked = Some(UnlockedState { master_key, seed });
        debug!("vault unlocked");
        Ok(())
    }

    /// Check a password against the sealed seed without touching the
    /// unlocked state. Lockout accounting belongs to the caller.
    pub fn verify_password(&self, password: &str) -> Result<bool> {
        if !self.is_initialized() {
            return Err(VaultError::NotInitialized);
        }
        let salt = self.read_salt()?;
        let master_key = derive_master_key(password.as_bytes(), &salt, self.scrypt)?;
        let sealed = fs::read(self.env_dir.join(SEED_FILE))?;
        match open_seed(&master_key, &sealed) {
            Ok(mut seed) => {
                seed.wipe();
                Ok(true)
            }
            Err(VaultError::AuthFailure) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wipe all resident secrets. Safe to call repeatedly.
    pub fn lock(&mut self) {
        if self.unlocked.take().is_some() {
            info!("vault locked, secrets wiped");
        }
    }

    /// Deterministic sub-key for a well-known purpose.
    pub fn derive_subkey(&self, purpose: SubKeyPurpose) -> Result<SecretBuffer> {
        self.derive_subkey_raw(purpose.label(), 32)
    }

    /// Deterministic sub-key for an arbitrary purpose label.
    pub fn derive_subkey_raw(&self, purpose: &[u8], len: usize) -> Result<SecretBuffer> {
        let state = self.unlocked.as_ref().ok_or(VaultError::Locked)?;
        let salt = blake2b_256(purpose);
        let key = state
            .seed
            .expose(|seed| derive_key(Some(&salt), seed, purpose, len))?;
        Ok(key)
    }

    /// Materialize a sub-key, run `f` on it, wipe before returning.
    /// The wipe happens on every exit path (drop runs on unwind too).
    pub fn with_subkey<R>(
        &self,
        purpose: SubKeyPurpose,
        f: impl FnOnce(&SecretBuffer) -> R,
    ) -> Result<R> {
        let mut key = self.derive_subkey(purpose)?;
        let result = f(&key);
        key.wipe();
        Ok(result)
    }

    /// Build the node identity from the identity and ecdh sub-keys.
    pub fn identity(&self) -> Result<NodeIdentity> {
        let mut identity_seed = self.derive_subkey(SubKeyPurpose::Identity)?;
        let mut ecdh_seed = self.derive_subkey(SubKeyPurpose::Ecdh)?;
        let identity = NodeIdentity::from_subkeys(&identity_seed, &ecdh_seed);
        identity_seed.wipe();
        ecdh_seed.wipe();
        identity
    }

    fn read_salt(&self) -> Result<[u8; 32]> {
        let path = self.env_dir.join(SALT_FILE);
        let bytes = fs::read(&path)
            .map_err(|_| VaultError::ConfigMissing(path.display().to_string()))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::Corrupt(format!("{} is not 32 bytes", path.display())))
    }
}

impl Drop for KeyVault {
    fn drop(&mut self) {
        self.lock();
    }
}

fn seal_seed(master_key: &SecretBuffer, seed: &SecretBuffer) -> Result<Vec<u8>> {
    let wrap_key = master_key.expose(|mk| derive_key(None, mk, SEED_WRAP_INFO, 32))?;
    let nonce = random_nonce();
    let ciphertext = wrap_key.expose(|wk| seed.expose(|s| aead::seal(wk, &nonce, s, SEED_AAD)))?;

    let mut blob = Vec::with_capacity(4 + nonce.len() + ciphertext.len());
    blob.extend_from_slice(SEED_MAGIC);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open_seed(master_key: &SecretBuffer, blob: &[u8]) -> Result<SecretBuffer> {
    if blob.len() < 4 + 12 || &blob[..4] != SEED_MAGIC {
        return Err(VaultError::Corrupt("sealed seed header".into()));
    }
    let nonce = &blob[4..16];
    let ciphertext = &blob[16..];

    let wrap_key = master_key.expose(|mk| derive_key(None, mk, SEED_WRAP_INFO, 32))?;
    let mut seed = wrap_key
        .expose(|wk| aead::open(wk, nonce, ciphertext, SEED_AAD))
        .map_err(|_| VaultError::AuthFailure)?;

    if seed.len() != 64 {
        seed.zeroize();
        return Err(VaultError::Corrupt("sealed seed length".into()));
    }
    Ok(SecretBuffer::from_vec(seed))
}

/// Write atomically (temp + rename) with owner-only permissions.
fn write_restricted(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
