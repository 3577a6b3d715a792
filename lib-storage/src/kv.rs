//! Encrypted key-value store
//!
//! Keys are hashed to disk names; values are file-store blobs. A small
//! encrypted index blob tracks the live key set so `keys` does not leak
//! plaintext names through the directory listing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::file_store::FileStore;
use crate::Result;

const INDEX_OBJECT: &str = "kv.index";

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvIndex {
    keys: BTreeSet<String>,
}

pub struct KvStore {
    files: FileStore,
}

impl KvStore {
    pub fn new(files: FileStore) -> Self {
        Self { files }
    }

    fn object_name(key: &str) -> String {
        format!("kv/{}", hex::encode(lib_crypto::blake2b_256(key.as_bytes())))
    }

    async fn load_index(&self) -> Result<KvIndex> {
        match self.files.get(INDEX_OBJECT).await {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| StorageError::Corrupt(format!("kv index: {e}"))),
            Err(StorageError::NotFound(_)) => Ok(KvIndex::default()),
            Err(e) => Err(e),
        }
    }

    async fn store_index(&self, index: &KvIndex) -> Result<()> {
        let bytes = bincode::serialize(index)
            .map_err(|e| StorageError::Corrupt(format!("kv index encode: {e}")))?;
        self.files.put(INDEX_OBJECT, &bytes).await
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.files.put(&Self::object_name(key), value).await?;
        let mut index = self.load_index().await?;
        if index.keys.insert(key.to_string()) {
            self.store_index(&index).await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.files
            .get(&Self::object_name(key))
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => StorageError::NotFound(key.to_string()),
                other => other,
            })
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.files.remove(&Self::object_name(key)).await?;
        let mut index = self.load_index().await?;
        if index.keys.remove(key) {
            self.store_index(&index).await?;
        }
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.load_index().await?.keys.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::{random_bytes, SecretBuffer};

    fn kv(dir: &std::path::Path) -> KvStore {
        KvStore::new(FileStore::new(dir, SecretBuffer::from_vec(random_bytes(32))))
    }

    #[tokio::test]
    async fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let kv = kv(dir.path());

        kv.put("peer/alpha", b"metadata").await.unwrap();
        assert_eq!(kv.get("peer/alpha").await.unwrap(), b"metadata");

        kv.remove("peer/alpha").await.unwrap();
        assert!(matches!(
            kv.get("peer/alpha").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn keys_tracks_live_set() {
        let dir = tempfile::tempdir().unwrap();
        let kv = kv(dir.path());

        kv.put("b", b"2").await.unwrap();
        kv.put("a", b"1").await.unwrap();
        kv.put("a", b"1-again").await.unwrap();

        assert_eq!(kv.keys().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn key_names_do_not_appear_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let kv = kv(dir.path());
        kv.put("visible-name", b"v").await.unwrap();

        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().into_string().unwrap();
            assert!(!name.contains("visible-name"));
        }
    }
}
