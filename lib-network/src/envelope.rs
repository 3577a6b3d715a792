//! Canonical envelope codec
//!
//! Wire layout, all integers big-endian, variable fields length-prefixed:
//!
//! ```text
//! version u16 | kind u16+bytes | from u16+bytes | to u16+bytes
//! | ts u64 | nonce [16] | body u32+bytes        <- signed region
//! | signature u16+bytes | extra (opaque tail)   <- unsigned
//! ```
//!
//! The detached signature covers exactly the canonical bytes of the
//! signed region. Bytes after the signature belong to future versions;
//! they are preserved on pass-through forwarding but never signed.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use lib_crypto::{random_envelope_nonce, verify_detached};
use lib_trust::PeerId;

use crate::error::NetworkError;
use crate::Result;

pub const ENVELOPE_VERSION: u16 = 1;
pub const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_FIELD_LEN: usize = 256;

/// Anything that can produce detached Ed25519 signatures for its own
/// identity. Implemented by the vault-backed node identity upstairs.
pub trait MessageSigner: Send + Sync {
    fn id(&self) -> &str;
    fn sign(&self, message: &[u8]) -> [u8; 64];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub kind: String,
    pub from: PeerId,
    pub to: PeerId,
    pub ts: u64,
    pub nonce: [u8; 16],
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
    /// Unknown trailing bytes from a future version, preserved verbatim.
    pub extra: Vec<u8>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Envelope {
    /// Build and sign an envelope with a fresh random nonce.
    pub fn build(
        signer: &dyn MessageSigner,
        to: PeerId,
        kind: impl Into<String>,
        body: Vec<u8>,
    ) -> Result<Self> {
        let kind = kind.into();
        if body.len() > MAX_BODY_BYTES {
            return Err(NetworkError::SizeLimit {
                limit: MAX_BODY_BYTES,
                actual: body.len(),
            });
        }
        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            kind,
            from: signer.id().to_string(),
            to,
            ts: now_secs(),
            nonce: random_envelope_nonce(),
            body,
            signature: Vec::new(),
            extra: Vec::new(),
        };
        envelope.signature = signer.sign(&envelope.canonical_bytes()).to_vec();
        Ok(envelope)
    }

    /// Canonical bytes of the signed region.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        push_str(&mut out, &self.kind);
        push_str(&mut out, &self.from);
        push_str(&mut out, &self.to);
        out.extend_from_slice(&self.ts.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Full wire encoding: signed region, signature, opaque tail.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.canonical_bytes();
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.extra);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor.u16()?;
        let kind = cursor.string()?;
        let from = cursor.string()?;
        let to = cursor.string()?;
        let ts = cursor.u64()?;
        let nonce: [u8; 16] = cursor
            .take(16)?
            .try_into()
            .expect("cursor returned 16 bytes");
        let body_len = cursor.u32()? as usize;
        if body_len > MAX_BODY_BYTES {
            return Err(NetworkError::SizeLimit {
                limit: MAX_BODY_BYTES,
                actual: body_len,
            });
        }
        let body = cursor.take(body_len)?.to_vec();
        let sig_len = cursor.u16()? as usize;
        let signature = cursor.take(sig_len)?.to_vec();
        let extra = cursor.rest().to_vec();

        Ok(Self {
            version,
            kind,
            from,
            to,
            ts,
            nonce,
            body,
            signature,
            extra,
        })
    }

    /// Recompute the canonical bytes from the received fields and check
    /// the detached signature against the sender's known public key.
    pub fn verify(&self, from_ed25519_public: &[u8]) -> Result<()> {
        verify_detached(from_ed25519_public, &self.canonical_bytes(), &self.signature)?;
        Ok(())
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Minimal bounds-checked reader for the canonical layouts.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(NetworkError::Malformed("truncated field".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(NetworkError::Malformed("string field too long".into()));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| NetworkError::Malformed("invalid utf-8 in field".into()))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::{sign_detached, SigningKeyPair};
    use rand::{Rng, RngCore};

    struct TestSigner {
        id: String,
        seed: [u8; 32],
    }

    impl MessageSigner for TestSigner {
        fn id(&self) -> &str {
            &self.id
        }
        fn sign(&self, message: &[u8]) -> [u8; 64] {
            sign_detached(&self.seed, message).expect("32-byte seed")
        }
    }

    fn signer(byte: u8) -> (TestSigner, [u8; 32]) {
        let seed = [byte; 32];
        let public = SigningKeyPair::from_seed(&seed).unwrap().public_bytes();
        (
            TestSigner {
                id: format!("node-{byte}"),
                seed,
            },
            public,
        )
    }

    #[test]
    fn encode_decode_verify_roundtrip() {
        let (signer, public) = signer(0x11);
        let envelope = Envelope::build(&signer, "node-2".into(), "ping", b"payload".to_vec()).unwrap();

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        decoded.verify(&public).unwrap();
    }

    #[test]
    fn altering_any_signed_field_breaks_verification() {
        let (signer, public) = signer(0x11);
        let envelope = Envelope::build(&signer, "node-2".into(), "gossip", b"data".to_vec()).unwrap();

        let mut e = envelope.clone();
        e.kind = "ping".into();
        assert!(e.verify(&public).is_err());

        let mut e = envelope.clone();
        e.to = "node-3".into();
        assert!(e.verify(&public).is_err());

        let mut e = envelope.clone();
        e.ts += 1;
        assert!(e.verify(&public).is_err());

        let mut e = envelope.clone();
        e.body = b"DATA".to_vec();
        assert!(e.verify(&public).is_err());

        let mut e = envelope;
        e.nonce[0] ^= 1;
        assert!(e.verify(&public).is_err());
    }

    #[test]
    fn unknown_trailing_bytes_survive_passthrough_unsigned() {
        let (signer, public) = signer(0x11);
        let mut envelope =
            Envelope::build(&signer, "node-2".into(), "ping", Vec::new()).unwrap();
        envelope.extra = vec![0xAB, 0xCD, 0xEF];

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.extra, vec![0xAB, 0xCD, 0xEF]);
        // Extra bytes never contribute to the signature.
        decoded.verify(&public).unwrap();
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (signer, _) = signer(0x11);
        let body = vec![0u8; MAX_BODY_BYTES + 1];
        assert!(matches!(
            Envelope::build(&signer, "node-2".into(), "gossip", body).unwrap_err(),
            NetworkError::SizeLimit { .. }
        ));
    }

    #[test]
    fn random_field_decode_never_panics() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..512);
            let mut bytes = vec![0u8; len];
            rng.fill_bytes(&mut bytes);
            // Must reject or parse, never panic.
            let _ = Envelope::decode(&bytes);
        }
    }

    #[test]
    fn encode_is_deterministic_for_same_fields() {
        let (signer, _) = signer(0x11);
        let envelope = Envelope::build(&signer, "node-2".into(), "ping", b"x".to_vec()).unwrap();
        assert_eq!(envelope.encode(), envelope.encode());
    }
}
