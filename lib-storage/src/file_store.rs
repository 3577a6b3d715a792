//! Encrypted file store
//!
//! Each named object gets its own HKDF-derived key
//! (`info = "file:" || hex(BLAKE2b-256(name))`) so compromising one file
//! key reveals nothing about its siblings. Writes are temp-file + rename.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use lib_crypto::{blake2b_256, derive_key, SecretBuffer};

use crate::blob;
use crate::error::StorageError;
use crate::{Result, MAX_OBJECT_BYTES};

pub struct FileStore {
    root: PathBuf,
    storage_key: SecretBuffer,
    max_object_bytes: usize,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, storage_key: SecretBuffer) -> Self {
        Self {
            root: root.into(),
            storage_key,
            max_object_bytes: MAX_OBJECT_BYTES,
        }
    }

    pub fn with_limit(mut self, max_object_bytes: usize) -> Self {
        self.max_object_bytes = max_object_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_key(&self, name: &str) -> Result<SecretBuffer> {
        let mut info = b"file:".to_vec();
        info.extend_from_slice(hex::encode(blake2b_256(name.as_bytes())).as_bytes());
        let key = self
            .storage_key
            .expose(|sk| derive_key(None, sk, &info, 32))?;
        Ok(key)
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.root
            .join(hex::encode(blake2b_256(name.as_bytes())))
            .with_extension("hsb")
    }

    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.max_object_bytes {
            return Err(StorageError::SizeLimit {
                limit: self.max_object_bytes,
                actual: bytes.len(),
            });
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let key = self.object_key(name)?;
        let sealed = blob::seal(&key, bytes, name.as_bytes())?;

        let path = self.disk_path(name);
        let tmp = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&sealed).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!(name, bytes = bytes.len(), "stored encrypted object");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.disk_path(name);
        let sealed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let key = self.object_key(name)?;
        blob::open(&key, &sealed, name.as_bytes())
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.disk_path(name).exists()
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.disk_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root)
            .field("max_object_bytes", &self.max_object_bytes)
            .finish()
    }
}
