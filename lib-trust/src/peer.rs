//! Peer records and trust levels

use serde::{Deserialize, Serialize};

/// Peer identifier: the hex BLAKE2b-256 of a node's Ed25519 public key,
/// or any operator-assigned string up to 256 characters.
pub type PeerId = String;

pub const MAX_PEER_ID_LEN: usize = 256;

/// Ordered trust levels. `Unknown` peers exist in the store but gate
/// nothing; delivery and channel establishment require at least `Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum TrustLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Ultimate,
}

impl TrustLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            TrustLevel::Unknown => 0,
            TrustLevel::Low => 1,
            TrustLevel::Medium => 2,
            TrustLevel::High => 3,
            TrustLevel::Ultimate => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrustLevel::Unknown),
            1 => Some(TrustLevel::Low),
            2 => Some(TrustLevel::Medium),
            3 => Some(TrustLevel::High),
            4 => Some(TrustLevel::Ultimate),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
            TrustLevel::Ultimate => "ultimate",
        };
        f.write_str(name)
    }
}

/// One trusted peer. `last_seq` / `last_update_hash` track the head of
/// this peer's own update chain when it acts as an issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustPeer {
    pub id: PeerId,
    pub ed25519_public: [u8; 32],
    pub x25519_public: [u8; 32],
    pub level: TrustLevel,
    pub added_at: u64,
    pub last_seq: u64,
    pub last_update_hash: [u8; 32],
}
