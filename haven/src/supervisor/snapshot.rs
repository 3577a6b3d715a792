//! Crash-recovery snapshots
//!
//! A compact descriptor of the node's recoverable state, persisted as
//! `snapshot-<seq>.bin` with an embedded BLAKE2b-256 checksum. Recovery
//! uses the newest snapshot whose checksum verifies; older files are
//! fallbacks only when newer ones fail verification.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lib_crypto::blake2b_256;
use lib_trust::TrustSnapshot;

const MAGIC: &[u8; 4] = b"HSS1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub state: String,
    pub deps: Vec<String>,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub dst: String,
    pub next_hop: String,
    pub metric: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub seq: u64,
    pub taken_at: u64,
    pub node_id: String,
    pub services: Vec<ServiceDescriptor>,
    pub routes: Vec<RouteDescriptor>,
    pub trust: TrustSnapshot,
}

fn snapshot_path(dir: &Path, seq: u64) -> std::path::PathBuf {
    dir.join(format!("snapshot-{seq}.bin"))
}

/// Persist one snapshot and prune beyond `keep`.
pub async fn write_snapshot(dir: &Path, snapshot: &NodeSnapshot, keep: usize) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let body = bincode::serialize(snapshot).context("encoding snapshot")?;
    let checksum = blake2b_256(&body);

    let mut blob = Vec::with_capacity(4 + 32 + body.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&checksum);
    blob.extend_from_slice(&body);

    let path = snapshot_path(dir, snapshot.seq);
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &blob).await?;
    tokio::fs::rename(&tmp, &path).await?;
    debug!(seq = snapshot.seq, "snapshot written");

    prune(dir, keep).await?;
    Ok(())
}

async fn prune(dir: &Path, keep: usize) -> Result<()> {
    let mut seqs = list_seqs(dir).await?;
    seqs.sort_unstable();
    while seqs.len() > keep {
        let seq = seqs.remove(0);
        let _ = tokio::fs::remove_file(snapshot_path(dir, seq)).await;
    }
    Ok(())
}

async fn list_seqs(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(seq) = name
            .strip_prefix("snapshot-")
            .and_then(|rest| rest.strip_suffix(".bin"))
            .and_then(|seq| seq.parse::<u64>().ok())
        {
            seqs.push(seq);
        }
    }
    Ok(seqs)
}

/// Load the newest snapshot whose checksum verifies.
pub async fn load_latest_valid(dir: &Path) -> Result<Option<NodeSnapshot>> {
    let mut seqs = list_seqs(dir).await?;
    seqs.sort_unstable_by(|a, b| b.cmp(a));

    for seq in seqs {
        let path = snapshot_path(dir, seq);
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(_) => continue,
        };
        match decode(&blob) {
            Ok(snapshot) => return Ok(Some(snapshot)),
            Err(e) => {
                warn!(seq, "snapshot failed verification, trying older: {e}");
            }
        }
    }
    Ok(None)
}

fn decode(blob: &[u8]) -> Result<NodeSnapshot> {
    anyhow::ensure!(blob.len() > 36 && &blob[..4] == MAGIC, "bad snapshot header");
    let checksum: [u8; 32] = blob[4..36].try_into().expect("32 bytes");
    let body = &blob[36..];
    anyhow::ensure!(blake2b_256(body) == checksum, "snapshot checksum mismatch");
    bincode::deserialize(body).context("decoding snapshot body")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(seq: u64) -> NodeSnapshot {
        NodeSnapshot {
            seq,
            taken_at: 1_700_000_000 + seq,
            node_id: "node".into(),
            services: vec![ServiceDescriptor {
                name: "router".into(),
                state: "running".into(),
                deps: vec!["transport".into()],
                restarts: 0,
            }],
            routes: vec![RouteDescriptor {
                dst: "c".into(),
                next_hop: "b".into(),
                metric: 2,
            }],
            trust: TrustSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn roundtrip_and_latest_selection() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), &snapshot(1), 5).await.unwrap();
        write_snapshot(dir.path(), &snapshot(2), 5).await.unwrap();

        let loaded = load_latest_valid(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.seq, 2);
        assert_eq!(loaded.routes[0].next_hop, "b");
    }

    #[tokio::test]
    async fn corrupt_newest_falls_back_to_older() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(dir.path(), &snapshot(1), 5).await.unwrap();
        write_snapshot(dir.path(), &snapshot(2), 5).await.unwrap();

        // Flip a byte in the newest body.
        let path = dir.path().join("snapshot-2.bin");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let loaded = load_latest_valid(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.seq, 1);
    }

    #[tokio::test]
    async fn pruning_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for seq in 1..=7 {
            write_snapshot(dir.path(), &snapshot(seq), 3).await.unwrap();
        }
        let mut seqs = list_seqs(dir.path()).await.unwrap();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn empty_dir_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_latest_valid(dir.path()).await.unwrap().is_none());
    }
}
