//! Signed, hash-chained trust updates
//!
//! Canonical encoding: fields in declaration order, big-endian integers,
//! length-prefixed variable fields. The update hash covers
//! `seq || prev_hash || op || payload || nonce`; each issuer's next
//! update must carry the previous update's hash.

use serde::{Deserialize, Serialize};

use lib_crypto::{blake2b_256_parts, random_envelope_nonce, sign_detached, verify_detached};

use crate::error::TrustError;
use crate::peer::{PeerId, TrustLevel, MAX_PEER_ID_LEN};
use crate::Result;

/// Chain genesis predecessor: all zeroes.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustOp {
    Add,
    Remove,
    SetLevel,
}

impl TrustOp {
    pub fn as_u8(self) -> u8 {
        match self {
            TrustOp::Add => 0,
            TrustOp::Remove => 1,
            TrustOp::SetLevel => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrustOp::Add),
            1 => Some(TrustOp::Remove),
            2 => Some(TrustOp::SetLevel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustUpdate {
    pub seq: u64,
    pub prev_hash: [u8; 32],
    pub op: TrustOp,
    pub target: PeerId,
    pub payload: Vec<u8>,
    pub nonce: [u8; 16],
    pub issuer: PeerId,
    pub signature: Vec<u8>,
}

impl TrustUpdate {
    /// Build and sign an update. `sign` receives the canonical unsigned
    /// bytes; the key vault supplies it as a scoped loan.
    pub fn build(
        seq: u64,
        prev_hash: [u8; 32],
        op: TrustOp,
        target: PeerId,
        payload: Vec<u8>,
        issuer: PeerId,
        sign: impl FnOnce(&[u8]) -> [u8; 64],
    ) -> Result<Self> {
        if target.len() > MAX_PEER_ID_LEN || issuer.len() > MAX_PEER_ID_LEN {
            return Err(TrustError::Malformed("peer id exceeds 256 chars".into()));
        }
        let mut update = Self {
            seq,
            prev_hash,
            op,
            target,
            payload,
            nonce: random_envelope_nonce(),
            issuer,
            signature: Vec::new(),
        };
        update.signature = sign(&update.canonical_bytes()).to_vec();
        Ok(update)
    }

    /// Canonical unsigned encoding; the detached signature covers this.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.push(self.op.as_u8());
        out.extend_from_slice(&(self.target.len() as u16).to_be_bytes());
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.issuer.len() as u16).to_be_bytes());
        out.extend_from_slice(self.issuer.as_bytes());
        out
    }

    /// Chain hash: `H(seq || prev_hash || op || payload || nonce)`.
    pub fn update_hash(&self) -> [u8; 32] {
        blake2b_256_parts(&[
            &self.seq.to_be_bytes(),
            &self.prev_hash,
            &[self.op.as_u8()],
            &self.payload,
            &self.nonce,
        ])
    }

    pub fn verify(&self, issuer_ed25519_public: &[u8]) -> Result<()> {
        verify_detached(
            issuer_ed25519_public,
            &self.canonical_bytes(),
            &self.signature,
        )?;
        Ok(())
    }

    /// Convenience signer for tests and self-issued updates where the
    /// raw signing seed is at hand.
    pub fn sign_with_seed(
        seed: &[u8],
        seq: u64,
        prev_hash: [u8; 32],
        op: TrustOp,
        target: PeerId,
        payload: Vec<u8>,
        issuer: PeerId,
    ) -> Result<Self> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| TrustError::Malformed("signing seed must be 32 bytes".into()))?;
        Self::build(seq, prev_hash, op, target, payload, issuer, |bytes| {
            sign_detached(&seed, bytes).expect("32-byte seed")
        })
    }
}

/// `Add` payload: both public keys plus the initial level.
pub fn encode_add_payload(
    ed25519_public: &[u8; 32],
    x25519_public: &[u8; 32],
    level: TrustLevel,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(ed25519_public);
    out.extend_from_slice(x25519_public);
    out.push(level.as_u8());
    out
}

pub fn decode_add_payload(payload: &[u8]) -> Result<([u8; 32], [u8; 32], TrustLevel)> {
    if payload.len() != 65 {
        return Err(TrustError::Malformed("add payload must be 65 bytes".into()));
    }
    let ed: [u8; 32] = payload[..32].try_into().unwrap();
    let x: [u8; 32] = payload[32..64].try_into().unwrap();
    let level = TrustLevel::from_u8(payload[64])
        .ok_or_else(|| TrustError::Malformed("invalid trust level".into()))?;
    Ok((ed, x, level))
}

/// `SetLevel` payload: one level byte.
pub fn encode_level_payload(level: TrustLevel) -> Vec<u8> {
    vec![level.as_u8()]
}

pub fn decode_level_payload(payload: &[u8]) -> Result<TrustLevel> {
    if payload.len() != 1 {
        return Err(TrustError::Malformed("level payload must be 1 byte".into()));
    }
    TrustLevel::from_u8(payload[0])
        .ok_or_else(|| TrustError::Malformed("invalid trust level".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::SigningKeyPair;

    #[test]
    fn signature_covers_all_fields() {
        let seed = [5u8; 32];
        let pair = SigningKeyPair::from_seed(&seed).unwrap();
        let update = TrustUpdate::sign_with_seed(
            &seed,
            1,
            GENESIS_HASH,
            TrustOp::Add,
            "peer-b".into(),
            encode_add_payload(&[1u8; 32], &[2u8; 32], TrustLevel::Low),
            "issuer-a".into(),
        )
        .unwrap();

        update.verify(&pair.public_bytes()).unwrap();

        let mut tampered = update.clone();
        tampered.seq = 2;
        assert!(tampered.verify(&pair.public_bytes()).is_err());

        let mut tampered = update;
        tampered.target = "peer-c".into();
        assert!(tampered.verify(&pair.public_bytes()).is_err());
    }

    #[test]
    fn chain_hash_links() {
        let seed = [5u8; 32];
        let first = TrustUpdate::sign_with_seed(
            &seed,
            1,
            GENESIS_HASH,
            TrustOp::Add,
            "b".into(),
            encode_add_payload(&[1u8; 32], &[2u8; 32], TrustLevel::Low),
            "a".into(),
        )
        .unwrap();

        let second = TrustUpdate::sign_with_seed(
            &seed,
            2,
            first.update_hash(),
            TrustOp::SetLevel,
            "b".into(),
            encode_level_payload(TrustLevel::Medium),
            "a".into(),
        )
        .unwrap();

        assert_eq!(second.prev_hash, first.update_hash());
        assert_ne!(first.update_hash(), second.update_hash());
    }

    #[test]
    fn payload_codecs_roundtrip() {
        let (ed, x, level) =
            decode_add_payload(&encode_add_payload(&[9u8; 32], &[8u8; 32], TrustLevel::High))
                .unwrap();
        assert_eq!(ed, [9u8; 32]);
        assert_eq!(x, [8u8; 32]);
        assert_eq!(level, TrustLevel::High);

        assert_eq!(
            decode_level_payload(&encode_level_payload(TrustLevel::Ultimate)).unwrap(),
            TrustLevel::Ultimate
        );
    }
}
