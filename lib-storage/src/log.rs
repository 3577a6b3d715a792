//! Append-only encrypted log
//!
//! Records are individually sealed and written as `u32 length || blob`.
//! The active segment rotates to `archive-<n>` past a byte threshold;
//! readers walk archives in order, then the active segment.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use lib_crypto::SecretBuffer;

use crate::blob;
use crate::error::StorageError;
use crate::{Result, MAX_OBJECT_BYTES};

const CURRENT_SEGMENT: &str = "current";
const LOG_AAD: &[u8] = b"haven.log.v1";

/// Default rotation threshold for the active segment.
pub const DEFAULT_ROTATE_BYTES: u64 = 4 * 1024 * 1024;

pub struct AppendLog {
    dir: PathBuf,
    key: SecretBuffer,
    rotate_bytes: u64,
}

impl AppendLog {
    pub fn new(dir: impl Into<PathBuf>, key: SecretBuffer) -> Self {
        Self {
            dir: dir.into(),
            key,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
        }
    }

    pub fn with_rotation(mut self, rotate_bytes: u64) -> Self {
        self.rotate_bytes = rotate_bytes;
        self
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_SEGMENT)
    }

    fn archive_path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("archive-{n}"))
    }

    async fn next_archive_index(&self) -> u32 {
        let mut n = 0;
        while self.archive_path(n).exists() {
            n += 1;
        }
        n
    }

    /// Append one record, rotating first if the active segment is full.
    pub async fn append(&self, record: &[u8]) -> Result<()> {
        if record.len() > MAX_OBJECT_BYTES {
            return Err(StorageError::SizeLimit {
                limit: MAX_OBJECT_BYTES,
                actual: record.len(),
            });
        }
        tokio::fs::create_dir_all(&self.dir).await?;

        let current = self.current_path();
        if let Ok(meta) = tokio::fs::metadata(&current).await {
            if meta.len() >= self.rotate_bytes {
                let archive = self.archive_path(self.next_archive_index().await);
                tokio::fs::rename(&current, &archive).await?;
                debug!(archive = %archive.display(), "rotated log segment");
            }
        }

        let sealed = blob::seal(&self.key, record, LOG_AAD)?;
        let mut frame = Vec::with_capacity(4 + sealed.len());
        frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        frame.extend_from_slice(&sealed);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current)
            .await?;
        file.write_all(&frame).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read and decrypt every record, oldest first.
    pub async fn read_all(&self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();

        let mut n = 0;
        while self.archive_path(n).exists() {
            self.read_segment(&self.archive_path(n), &mut records).await?;
            n += 1;
        }
        if self.current_path().exists() {
            self.read_segment(&self.current_path(), &mut records).await?;
        }
        Ok(records)
    }

    async fn read_segment(&self, path: &Path, out: &mut Vec<Vec<u8>>) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let mut offset = 0usize;

        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(StorageError::Corrupt(format!(
                    "truncated frame header in {}",
                    path.display()
                )));
            }
            let len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > bytes.len() {
                return Err(StorageError::Corrupt(format!(
                    "truncated record in {}",
                    path.display()
                )));
            }
            let record = blob::open(&self.key, &bytes[offset..offset + len], LOG_AAD)?;
            out.push(record);
            offset += len;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("dir", &self.dir)
            .field("rotate_bytes", &self.rotate_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::random_bytes;

    fn log(dir: &Path) -> AppendLog {
        AppendLog::new(dir, SecretBuffer::from_vec(random_bytes(32)))
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path());

        log.append(b"first").await.unwrap();
        log.append(b"second").await.unwrap();
        log.append(b"third").await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    }

    #[tokio::test]
    async fn rotation_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold forces a rotation after every record.
        let log = log(dir.path()).with_rotation(1);

        for i in 0..5u8 {
            log.append(&[i]).await.unwrap();
        }

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, &vec![i as u8]);
        }
        assert!(dir.path().join("archive-0").exists());
    }

    #[tokio::test]
    async fn corrupt_record_stops_reader() {
        let dir = tempfile::tempdir().unwrap();
        let log = log(dir.path());
        log.append(b"good").await.unwrap();

        // Truncate the active segment mid-record.
        let current = dir.path().join("current");
        let raw = std::fs::read(&current).unwrap();
        std::fs::write(&current, &raw[..raw.len() - 3]).unwrap();

        assert!(matches!(
            log.read_all().await.unwrap_err(),
            StorageError::Corrupt(_)
        ));
    }
}
