//! Multi-hop router
//!
//! Routing table of `(destination, next-hop)` entries with lazy expiry,
//! TTL-bounded forwarding, per-hop signatures over
//! `BLAKE2b(src || dst || payload || prior hops)`, loop rejection, and
//! at-most-once delivery per `(sender, envelope nonce)` within the
//! dedup window. A forwarder decrements the TTL and drops the message
//! when it reaches zero; delivery to the destination is checked first,
//! so a TTL of `k` traverses at most `k` forwarders.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use lib_crypto::{blake2b_256_parts, verify_detached};
use lib_trust::{PeerId, TrustLevel, TrustStore};

use crate::channel::ChannelManager;
use crate::dedup::NonceWindow;
use crate::envelope::{Cursor, Envelope, MessageSigner};
use crate::error::NetworkError;
use crate::transport::Transport;
use crate::Result;

/// Hop budget for locally originated messages.
pub const DEFAULT_TTL: u8 = 8;

/// Routes are refreshed on use and expire when idle.
pub const ROUTE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Route {
    pub dst: PeerId,
    pub next_hop: PeerId,
    pub metric: u32,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSignature {
    pub peer_id: PeerId,
    pub signature: Vec<u8>,
}

/// A message in flight across the overlay. `payload` is a complete
/// signed envelope; the routed wrapper adds addressing, a TTL and the
/// hop audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub src: PeerId,
    pub dst: PeerId,
    pub ttl: u8,
    pub payload: Vec<u8>,
    pub hops: Vec<HopSignature>,
}

impl RoutedMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.payload.len());
        push_str(&mut out, &self.src);
        push_str(&mut out, &self.dst);
        out.push(self.ttl);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&(self.hops.len() as u16).to_be_bytes());
        for hop in &self.hops {
            push_str(&mut out, &hop.peer_id);
            out.extend_from_slice(&(hop.signature.len() as u16).to_be_bytes());
            out.extend_from_slice(&hop.signature);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let src = cursor.string()?;
        let dst = cursor.string()?;
        let ttl = cursor.u8()?;
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();
        let hop_count = cursor.u16()? as usize;
        let mut hops = Vec::with_capacity(hop_count.min(64));
        for _ in 0..hop_count {
            let peer_id = cursor.string()?;
            let sig_len = cursor.u16()? as usize;
            let signature = cursor.take(sig_len)?.to_vec();
            hops.push(HopSignature { peer_id, signature });
        }
        Ok(Self {
            src,
            dst,
            ttl,
            payload,
            hops,
        })
    }

    /// Digest a forwarder signs: source, destination, payload, and the
    /// hop list as it stood before this forwarder.
    pub fn hop_digest(&self, prior_hops: &[HopSignature]) -> [u8; 32] {
        let mut hops_bytes = Vec::new();
        for hop in prior_hops {
            push_str(&mut hops_bytes, &hop.peer_id);
            hops_bytes.extend_from_slice(&hop.signature);
        }
        blake2b_256_parts(&[
            self.src.as_bytes(),
            self.dst.as_bytes(),
            &self.payload,
            &hops_bytes,
        ])
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub dst: PeerId,
    pub next_hop: PeerId,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    pub delivered: u64,
    pub forwarded: u64,
    pub ttl_expired: u64,
    pub loops: u64,
    pub no_route: u64,
    pub replays: u64,
    pub bad_hops: u64,
}

/// Associated data for link frames: binds the ciphertext to the two
/// transport endpoints of this hop.
fn link_ad(from: &str, to: &str) -> Vec<u8> {
    let mut ad = b"haven.routed.v1:".to_vec();
    ad.extend_from_slice(from.as_bytes());
    ad.push(b'>');
    ad.extend_from_slice(to.as_bytes());
    ad
}

pub struct Router {
    self_id: PeerId,
    trust: Arc<TrustStore>,
    channels: Arc<ChannelManager>,
    transport: Arc<Transport>,
    signer: Arc<dyn MessageSigner>,
    routes: RwLock<HashMap<PeerId, Route>>,
    dedup: Mutex<NonceWindow>,
    stats: Mutex<RouterStats>,
    inbound_tx: mpsc::Sender<Envelope>,
}

impl Router {
    pub fn new(
        trust: Arc<TrustStore>,
        channels: Arc<ChannelManager>,
        transport: Arc<Transport>,
        signer: Arc<dyn MessageSigner>,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        (
            Self {
                self_id: signer.id().to_string(),
                trust,
                channels,
                transport,
                signer,
                routes: RwLock::new(HashMap::new()),
                dedup: Mutex::new(NonceWindow::default()),
                stats: Mutex::new(RouterStats::default()),
                inbound_tx,
            },
            inbound_rx,
        )
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn add_route(&self, dst: PeerId, next_hop: PeerId, metric: u32) {
        let route = Route {
            dst: dst.clone(),
            next_hop,
            metric,
            expires_at: Instant::now() + ROUTE_TTL,
        };
        self.routes.write().insert(dst, route);
    }

    pub fn remove_route(&self, dst: &str) -> bool {
        self.routes.write().remove(dst).is_some()
    }

    pub fn list_routes(&self) -> Vec<Route> {
        let now = Instant::now();
        self.routes
            .read()
            .values()
            .filter(|r| r.expires_at > now)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> RouterStats {
        *self.stats.lock()
    }

    /// Next hop toward `dst`: a live channel to the peer itself wins,
    /// otherwise the routing table. Expired entries are evicted here;
    /// used entries are refreshed.
    fn next_hop(&self, dst: &str) -> Option<PeerId> {
        if self.channels.is_open(dst) && self.transport.is_connected(dst) {
            return Some(dst.to_string());
        }
        let mut routes = self.routes.write();
        match routes.get_mut(dst) {
            Some(route) if route.expires_at > Instant::now() => {
                route.expires_at = Instant::now() + ROUTE_TTL;
                Some(route.next_hop.clone())
            }
            Some(_) => {
                routes.remove(dst);
                None
            }
            None => None,
        }
    }

    /// Send a signed envelope toward `dst` with the default hop budget.
    pub async fn send(&self, dst: &str, envelope: Envelope) -> Result<DeliveryReceipt> {
        self.send_with_ttl(dst, envelope, DEFAULT_TTL).await
    }

    pub async fn send_with_ttl(
        &self,
        dst: &str,
        envelope: Envelope,
        ttl: u8,
    ) -> Result<DeliveryReceipt> {
        let message_id = hex::encode(envelope.nonce);

        if dst == self.self_id {
            // Loopback: deliver without touching the wire.
            let _ = self.inbound_tx.send(envelope).await;
            return Ok(DeliveryReceipt {
                message_id,
                dst: dst.to_string(),
                next_hop: self.self_id.clone(),
            });
        }

        let message = RoutedMessage {
            src: self.self_id.clone(),
            dst: dst.to_string(),
            ttl,
            payload: envelope.encode(),
            hops: Vec::new(),
        };
        let next_hop = self.dispatch_to_wire(message).await?;
        Ok(DeliveryReceipt {
            message_id,
            dst: dst.to_string(),
            next_hop,
        })
    }

    /// Seal a routed message for its next hop and put it on the wire.
    async fn dispatch_to_wire(&self, message: RoutedMessage) -> Result<PeerId> {
        let next_hop = self
            .next_hop(&message.dst)
            .ok_or_else(|| {
                self.stats.lock().no_route += 1;
                NetworkError::NoRoute(message.dst.clone())
            })?;

        let ad = link_ad(&self.self_id, &next_hop);
        let (rekey, frame) = self.channels.seal(&next_hop, &message.encode(), &ad)?;
        if let Some(rekey_frame) = rekey {
            self.transport.send(&next_hop, rekey_frame).await?;
        }
        self.transport.send(&next_hop, frame).await?;
        Ok(next_hop)
    }

    /// Handle one inbound transport frame from `peer_id`. Control
    /// frames and forwarded messages return `Ok(())` silently; protocol
    /// rejections surface as counted errors.
    pub async fn receive(&self, peer_id: &str, frame_bytes: &[u8]) -> Result<()> {
        let ad = link_ad(peer_id, &self.self_id);
        let Some(plaintext) = self.channels.open_frame(peer_id, frame_bytes, &ad)? else {
            return Ok(()); // rekey control frame, consumed
        };
        let message = RoutedMessage::decode(&plaintext)?;

        // Envelope header drives dedup and, on delivery, verification.
        let envelope = Envelope::decode(&message.payload)?;
        if !self
            .dedup
            .lock()
            .observe(&envelope.from, envelope.nonce)
        {
            self.stats.lock().replays += 1;
            return Err(NetworkError::ReplayDrop);
        }

        self.verify_hops(&message)?;

        if message.dst == self.self_id {
            let sender = self
                .trust
                .get(&envelope.from)
                .ok_or_else(|| NetworkError::UnknownPeer(envelope.from.clone()))?;
            envelope.verify(&sender.ed25519_public)?;
            self.stats.lock().delivered += 1;
            let _ = self.inbound_tx.send(envelope).await;
            return Ok(());
        }

        self.forward(message).await
    }

    /// Loop check, TTL budget, route lookup, hop signature, pass on.
    async fn forward(&self, mut message: RoutedMessage) -> Result<()> {
        if message.hops.iter().any(|h| h.peer_id == self.self_id) {
            self.stats.lock().loops += 1;
            return Err(NetworkError::RoutingLoop(self.self_id.clone()));
        }

        if message.ttl <= 1 {
            self.stats.lock().ttl_expired += 1;
            return Err(NetworkError::TtlExpired);
        }
        message.ttl -= 1;

        let digest = message.hop_digest(&message.hops);
        message.hops.push(HopSignature {
            peer_id: self.self_id.clone(),
            signature: self.signer.sign(&digest).to_vec(),
        });

        let next_hop = self.dispatch_to_wire(message).await?;
        self.stats.lock().forwarded += 1;
        debug!(next_hop = %next_hop, "forwarded routed message");
        Ok(())
    }

    /// Every hop must be a distinct, trusted peer whose signature
    /// verifies over the message as it stood when that hop signed.
    fn verify_hops(&self, message: &RoutedMessage) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, hop) in message.hops.iter().enumerate() {
            if hop.peer_id == self.self_id || !seen.insert(hop.peer_id.as_str()) {
                self.stats.lock().loops += 1;
                return Err(NetworkError::RoutingLoop(hop.peer_id.clone()));
            }
            let peer = self.trust.get(&hop.peer_id).ok_or_else(|| {
                self.stats.lock().bad_hops += 1;
                NetworkError::UnknownPeer(hop.peer_id.clone())
            })?;
            if peer.level < TrustLevel::Low {
                self.stats.lock().bad_hops += 1;
                return Err(NetworkError::InsufficientTrust(hop.peer_id.clone()));
            }
            let digest = message.hop_digest(&message.hops[..i]);
            if verify_detached(&peer.ed25519_public, &digest, &hop.signature).is_err() {
                self.stats.lock().bad_hops += 1;
                warn!(hop = %hop.peer_id, "hop signature rejected");
                return Err(NetworkError::Crypto(
                    lib_crypto::CryptoError::SignatureMismatch,
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("self_id", &self.self_id)
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_message_codec_roundtrip() {
        let message = RoutedMessage {
            src: "a".into(),
            dst: "c".into(),
            ttl: 4,
            payload: b"envelope bytes".to_vec(),
            hops: vec![HopSignature {
                peer_id: "b".into(),
                signature: vec![7u8; 64],
            }],
        };
        let decoded = RoutedMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn hop_digest_changes_with_prior_hops() {
        let mut message = RoutedMessage {
            src: "a".into(),
            dst: "c".into(),
            ttl: 4,
            payload: b"payload".to_vec(),
            hops: Vec::new(),
        };
        let before = message.hop_digest(&message.hops);
        message.hops.push(HopSignature {
            peer_id: "b".into(),
            signature: vec![1u8; 64],
        });
        let after = message.hop_digest(&message.hops);
        assert_ne!(before, after);
    }

    #[test]
    fn truncated_message_is_malformed() {
        let message = RoutedMessage {
            src: "a".into(),
            dst: "c".into(),
            ttl: 4,
            payload: b"payload".to_vec(),
            hops: Vec::new(),
        };
        let bytes = message.encode();
        assert!(RoutedMessage::decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
