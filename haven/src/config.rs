//! Node configuration
//!
//! TOML file with CLI overrides; every field has a working default so a
//! bare `havend` boots a loopback-only node in `./env`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Directory holding salts, sealed seed, trust store and snapshots.
    pub env_dir: PathBuf,
    /// Peer transport listener.
    pub listen_addr: SocketAddr,
    /// Owner HTTP API; loopback by default and expected to stay there.
    pub http_addr: SocketAddr,
    /// tracing env-filter expression.
    pub log_filter: String,
    /// Mnemonic length at first boot (12/15/18/21/24).
    pub mnemonic_words: usize,
    /// CORS allow-list for the HTTP surface.
    pub cors_origins: Vec<String>,
    pub snapshot_interval_secs: u64,
    pub snapshots_kept: usize,
    /// Per-service budget for graceful stop.
    pub shutdown_budget_secs: u64,
    /// Health probe cadence.
    pub health_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            env_dir: PathBuf::from("env"),
            listen_addr: "0.0.0.0:7700".parse().expect("valid default"),
            http_addr: "127.0.0.1:7710".parse().expect("valid default"),
            log_filter: "info".to_string(),
            mnemonic_words: 24,
            cors_origins: vec![
                "http://127.0.0.1".to_string(),
                "http://localhost".to_string(),
            ],
            snapshot_interval_secs: 60,
            snapshots_kept: 5,
            shutdown_budget_secs: 5,
            health_interval_secs: 30,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: NodeConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.env_dir.join("control.sock")
    }

    pub fn ipc_token_path(&self) -> PathBuf {
        self.env_dir.join("ipc.token")
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.env_dir.join("trust.store")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.env_dir.join("state")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.env_dir.join("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback_for_http() {
        let config = NodeConfig::default();
        assert!(config.http_addr.ip().is_loopback());
        assert_eq!(config.mnemonic_words, 24);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: NodeConfig = toml::from_str("log-filter = \"debug\"\n").unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.snapshots_kept, 5);
    }

    #[test]
    fn derived_paths_live_under_env_dir() {
        let config = NodeConfig::default();
        assert!(config.trust_store_path().starts_with(&config.env_dir));
        assert!(config.snapshot_dir().starts_with(&config.env_dir));
    }
}
