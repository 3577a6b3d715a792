//! Per-peer secure channels
//!
//! Each direction of a link has its own AEAD key, derived from the
//! X25519 shared secret with a directional HKDF label, so both ends
//! agree on complementary keys regardless of who initiated. Frame
//! nonces are `generation || counter`; receivers enforce anti-replay
//! with a sliding bitmap window spanning the last 1024 counters.
//!
//! Rotation ratchets one direction at a time: the sender seals 32 fresh
//! random bytes in a control frame under the old key, then both ends
//! derive the next generation key as
//! `HKDF(salt = old directional key, ikm = fresh bytes)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use lib_crypto::{aead, derive_key, random_bytes, SecretBuffer};
use lib_trust::{PeerId, TrustLevel, TrustStore};

use crate::envelope::Cursor;
use crate::error::NetworkError;
use crate::Result;

/// Rotate after this many bytes sealed on one key generation.
pub const REKEY_BYTES_THRESHOLD: u64 = 1 << 30;
/// Or after this much wall-clock time.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Consecutive decrypt failures before the channel is force-closed.
const CRYPTO_FAILURE_THRESHOLD: u32 = 8;

const WINDOW_WORDS: usize = 16;
const WINDOW_BITS: u64 = (WINDOW_WORDS as u64) * 64;

const CHANNEL_SALT: &[u8] = b"haven.channel.v1";
const REKEY_INFO: &[u8] = b"haven.channel.rekey.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Handshaking,
    Open,
    Rekeying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Rekey,
}

impl FrameType {
    fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Rekey => 1,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Rekey),
            _ => None,
        }
    }
}

/// One sealed frame: `type u8 | generation u32 | counter u64 | ct u32+bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFrame {
    pub frame_type: FrameType,
    pub generation: u32,
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

impl ChannelFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17 + self.ciphertext.len());
        out.push(self.frame_type.as_u8());
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let frame_type = FrameType::from_u8(cursor.u8()?)
            .ok_or_else(|| NetworkError::Malformed("unknown frame type".into()))?;
        let generation = cursor.u32()?;
        let counter = cursor.u64()?;
        let len = cursor.u32()? as usize;
        let ciphertext = cursor.take(len)?.to_vec();
        Ok(Self {
            frame_type,
            generation,
            counter,
            ciphertext,
        })
    }
}

/// Sliding anti-replay bitmap. Bit offset 0 is the highest accepted
/// counter; the window spans the preceding `WINDOW_BITS` counters.
#[derive(Debug, Clone)]
struct ReplayWindow {
    hi: u64,
    bits: [u64; WINDOW_WORDS],
    seen_any: bool,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            hi: 0,
            bits: [0; WINDOW_WORDS],
            seen_any: false,
        }
    }

    /// Would `counter` be accepted right now?
    fn precheck(&self, counter: u64) -> Result<()> {
        if !self.seen_any {
            return Ok(());
        }
        if counter > self.hi {
            return Ok(());
        }
        let offset = self.hi - counter;
        if offset >= WINDOW_BITS {
            return Err(NetworkError::ReplayDrop);
        }
        if self.bits[(offset / 64) as usize] & (1u64 << (offset % 64)) != 0 {
            return Err(NetworkError::ReplayDrop);
        }
        Ok(())
    }

    /// Record `counter` as accepted. Call only after `precheck` and a
    /// successful decrypt.
    fn commit(&mut self, counter: u64) {
        if !self.seen_any {
            self.hi = counter;
            self.bits = [0; WINDOW_WORDS];
            self.bits[0] = 1;
            self.seen_any = true;
            return;
        }
        if counter > self.hi {
            let shift = counter - self.hi;
            self.shift_up(shift);
            self.bits[0] |= 1;
            self.hi = counter;
        } else {
            let offset = self.hi - counter;
            self.bits[(offset / 64) as usize] |= 1u64 << (offset % 64);
        }
    }

    fn shift_up(&mut self, by: u64) {
        if by >= WINDOW_BITS {
            self.bits = [0; WINDOW_WORDS];
            return;
        }
        let word_shift = (by / 64) as usize;
        let bit_shift = (by % 64) as u32;
        for i in (0..WINDOW_WORDS).rev() {
            let mut v = if i >= word_shift {
                self.bits[i - word_shift] << bit_shift
            } else {
                0
            };
            if bit_shift > 0 && i > word_shift {
                v |= self.bits[i - word_shift - 1] >> (64 - bit_shift);
            }
            self.bits[i] = v;
        }
    }
}

struct PrevGeneration {
    generation: u32,
    key: SecretBuffer,
    window: ReplayWindow,
}

pub struct SecureChannel {
    peer_id: PeerId,
    state: ChannelState,
    send_generation: u32,
    recv_generation: u32,
    k_send: SecretBuffer,
    k_recv: SecretBuffer,
    n_send: u64,
    recv_window: ReplayWindow,
    prev_recv: Option<PrevGeneration>,
    bytes_sent: u64,
    created_at: Instant,
    rotated_at: Instant,
    rekey_bytes: u64,
    rekey_interval: Duration,
}

fn directional_key(
    shared_secret: &SecretBuffer,
    from: &str,
    to: &str,
) -> Result<SecretBuffer> {
    let info = format!("haven.chan:{from}->{to}");
    let key = shared_secret.expose(|s| derive_key(Some(CHANNEL_SALT), s, info.as_bytes(), 32))?;
    Ok(key)
}

fn ratchet_key(old_key: &SecretBuffer, fresh: &[u8]) -> Result<SecretBuffer> {
    let key = old_key.expose(|old| derive_key(Some(old), fresh, REKEY_INFO, 32))?;
    Ok(key)
}

fn nonce_bytes(generation: u32, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&generation.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Frame type joins the caller's associated data so a data frame can
/// never replay as a control frame.
fn frame_ad(frame_type: FrameType, associated_data: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(1 + associated_data.len());
    ad.push(frame_type.as_u8());
    ad.extend_from_slice(associated_data);
    ad
}

impl SecureChannel {
    /// Derive both directional keys from the X25519 shared secret.
    pub fn open(local_id: &str, peer_id: PeerId, shared_secret: &SecretBuffer) -> Result<Self> {
        let k_send = directional_key(shared_secret, local_id, &peer_id)?;
        let k_recv = directional_key(shared_secret, &peer_id, local_id)?;
        let now = Instant::now();
        Ok(Self {
            peer_id,
            state: ChannelState::Open,
            send_generation: 0,
            recv_generation: 0,
            k_send,
            k_recv,
            n_send: 0,
            recv_window: ReplayWindow::new(),
            prev_recv: None,
            bytes_sent: 0,
            created_at: now,
            rotated_at: now,
            rekey_bytes: REKEY_BYTES_THRESHOLD,
            rekey_interval: REKEY_INTERVAL,
        })
    }

    pub fn with_rekey_thresholds(mut self, bytes: u64, interval: Duration) -> Self {
        self.rekey_bytes = bytes;
        self.rekey_interval = interval;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            ChannelState::Open | ChannelState::Rekeying => Ok(()),
            _ => Err(NetworkError::ChannelClosed(self.peer_id.clone())),
        }
    }

    /// Seal one outbound data frame. The counter is strictly monotonic
    /// within the current send generation.
    pub fn seal(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<ChannelFrame> {
        self.ensure_usable()?;
        let counter = self.n_send;
        let nonce = nonce_bytes(self.send_generation, counter);
        let ad = frame_ad(FrameType::Data, associated_data);
        let ciphertext = self
            .k_send
            .expose(|k| aead::seal(k, &nonce, plaintext, &ad))?;

        self.n_send += 1;
        self.bytes_sent += ciphertext.len() as u64;
        Ok(ChannelFrame {
            frame_type: FrameType::Data,
            generation: self.send_generation,
            counter,
            ciphertext,
        })
    }

    /// Ratchet the send direction if a threshold tripped. Returns the
    /// control frame that must be delivered to the peer before any
    /// frame of the new generation.
    pub fn maybe_rekey(&mut self) -> Result<Option<ChannelFrame>> {
        self.ensure_usable()?;
        let due = self.bytes_sent >= self.rekey_bytes
            || self.rotated_at.elapsed() >= self.rekey_interval;
        if !due {
            return Ok(None);
        }
        self.state = ChannelState::Rekeying;

        let fresh = random_bytes(32);
        let counter = self.n_send;
        let nonce = nonce_bytes(self.send_generation, counter);
        let ad = frame_ad(FrameType::Rekey, &[]);
        let ciphertext = self.k_send.expose(|k| aead::seal(k, &nonce, &fresh, &ad))?;
        let frame = ChannelFrame {
            frame_type: FrameType::Rekey,
            generation: self.send_generation,
            counter,
            ciphertext,
        };

        let new_key = ratchet_key(&self.k_send, &fresh)?;
        self.k_send.wipe();
        self.k_send = new_key;
        self.send_generation += 1;
        self.n_send = 0;
        self.bytes_sent = 0;
        self.rotated_at = Instant::now();
        self.state = ChannelState::Open;
        info!(peer = %self.peer_id, generation = self.send_generation, "send key rotated");
        Ok(Some(frame))
    }

    /// Open one inbound frame. Returns the plaintext for data frames;
    /// control frames are consumed internally and yield `None`.
    pub fn open_frame(
        &mut self,
        frame: &ChannelFrame,
        associated_data: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;

        enum Slot {
            Current,
            Previous,
        }

        let slot = if frame.generation == self.recv_generation {
            Slot::Current
        } else if self
            .prev_recv
            .as_ref()
            .map(|p| p.generation == frame.generation)
            .unwrap_or(false)
        {
            // Only data frames ride out the grace window; a second
            // ratchet must come on the current generation.
            if frame.frame_type == FrameType::Rekey {
                return Err(NetworkError::ReplayDrop);
            }
            Slot::Previous
        } else {
            return Err(NetworkError::ReplayDrop);
        };

        let (key, window) = match slot {
            Slot::Current => (&self.k_recv, &mut self.recv_window),
            Slot::Previous => {
                let prev = self.prev_recv.as_mut().expect("checked above");
                (&prev.key, &mut prev.window)
            }
        };

        window.precheck(frame.counter)?;

        let nonce = nonce_bytes(frame.generation, frame.counter);
        let ad = match frame.frame_type {
            FrameType::Data => frame_ad(FrameType::Data, associated_data),
            FrameType::Rekey => frame_ad(FrameType::Rekey, &[]),
        };
        let plaintext = key.expose(|k| aead::open(k, &nonce, &frame.ciphertext, &ad))?;
        window.commit(frame.counter);

        match frame.frame_type {
            FrameType::Data => Ok(Some(plaintext)),
            FrameType::Rekey => {
                // Install the next receive generation; keep the old key
                // for frames still in flight.
                let new_key = ratchet_key(&self.k_recv, &plaintext)?;
                let old_key = std::mem::replace(&mut self.k_recv, new_key);
                let old_window = std::mem::replace(&mut self.recv_window, ReplayWindow::new());
                if let Some(mut prev) = self.prev_recv.take() {
                    prev.key.wipe();
                }
                self.prev_recv = Some(PrevGeneration {
                    generation: self.recv_generation,
                    key: old_key,
                    window: old_window,
                });
                self.recv_generation += 1;
                debug!(peer = %self.peer_id, generation = self.recv_generation, "receive key rotated");
                Ok(None)
            }
        }
    }

    /// Wipe every key and refuse further use.
    pub fn close(&mut self, reason: &str) {
        self.k_send.wipe();
        self.k_recv.wipe();
        if let Some(mut prev) = self.prev_recv.take() {
            prev.key.wipe();
        }
        self.state = ChannelState::Closed;
        info!(peer = %self.peer_id, reason, "channel closed");
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("send_generation", &self.send_generation)
            .field("recv_generation", &self.recv_generation)
            .field("n_send", &self.n_send)
            .finish()
    }
}

/// Owns all channels and gates establishment on the trust store.
pub struct ChannelManager {
    local_id: PeerId,
    trust: Arc<TrustStore>,
    channels: Mutex<HashMap<PeerId, SecureChannel>>,
    crypto_failures: Mutex<HashMap<PeerId, u32>>,
}

impl ChannelManager {
    pub fn new(local_id: PeerId, trust: Arc<TrustStore>) -> Self {
        Self {
            local_id,
            trust,
            channels: Mutex::new(HashMap::new()),
            crypto_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Open a channel; requires the peer at trust level `Low` or above.
    pub fn open(&self, peer_id: &str, shared_secret: &SecretBuffer) -> Result<()> {
        if self.trust.level(peer_id) < TrustLevel::Low {
            return Err(NetworkError::InsufficientTrust(peer_id.to_string()));
        }
        let channel = SecureChannel::open(&self.local_id, peer_id.to_string(), shared_secret)?;
        self.channels.lock().insert(peer_id.to_string(), channel);
        debug!(peer = %peer_id, "secure channel opened");
        Ok(())
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.channels
            .lock()
            .get(peer_id)
            .map(|c| matches!(c.state(), ChannelState::Open | ChannelState::Rekeying))
            .unwrap_or(false)
    }

    pub fn state(&self, peer_id: &str) -> Option<ChannelState> {
        self.channels.lock().get(peer_id).map(|c| c.state())
    }

    /// Seal a payload, emitting `(rekey_frame, data_frame)` encodings.
    /// The rekey frame, when present, must be sent first.
    pub fn seal(
        &self,
        peer_id: &str,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(peer_id)
            .ok_or_else(|| NetworkError::ChannelNotOpen(peer_id.to_string()))?;
        let rekey = channel.maybe_rekey()?.map(|f| f.encode());
        let frame = channel.seal(plaintext, associated_data)?;
        Ok((rekey, frame.encode()))
    }

    /// Decrypt an inbound frame. Decrypt failures are counted per peer;
    /// past the threshold the channel is closed.
    pub fn open_frame(
        &self,
        peer_id: &str,
        frame_bytes: &[u8],
        associated_data: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let frame = ChannelFrame::decode(frame_bytes)?;
        let mut channels = self.channels.lock();
        let channel = channels
            .get_mut(peer_id)
            .ok_or_else(|| NetworkError::ChannelNotOpen(peer_id.to_string()))?;

        match channel.open_frame(&frame, associated_data) {
            Ok(plaintext) => {
                self.crypto_failures.lock().remove(peer_id);
                Ok(plaintext)
            }
            Err(e) => {
                if matches!(e, NetworkError::Crypto(_)) {
                    let mut failures = self.crypto_failures.lock();
                    let count = failures.entry(peer_id.to_string()).or_insert(0);
                    *count += 1;
                    if *count >= CRYPTO_FAILURE_THRESHOLD {
                        warn!(peer = %peer_id, "crypto failure threshold reached, closing channel");
                        channel.close("crypto failure threshold");
                        failures.remove(peer_id);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn close(&self, peer_id: &str, reason: &str) {
        if let Some(channel) = self.channels.lock().get_mut(peer_id) {
            channel.close(reason);
        }
    }

    /// Wipe every channel; used during shutdown.
    pub fn close_all(&self, reason: &str) {
        let mut channels = self.channels.lock();
        for channel in channels.values_mut() {
            channel.close(reason);
        }
        channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::AgreementKeyPair;

    fn pair() -> (SecureChannel, SecureChannel) {
        let a_keys = AgreementKeyPair::from_seed(&[1u8; 32]).unwrap();
        let b_keys = AgreementKeyPair::from_seed(&[2u8; 32]).unwrap();
        let shared_a = a_keys.agree(&b_keys.public_bytes()).unwrap();
        let shared_b = b_keys.agree(&a_keys.public_bytes()).unwrap();

        let a = SecureChannel::open("node-a", "node-b".into(), &shared_a).unwrap();
        let b = SecureChannel::open("node-b", "node-a".into(), &shared_b).unwrap();
        (a, b)
    }

    #[test]
    fn complementary_keys_roundtrip_both_directions() {
        let (mut a, mut b) = pair();

        let frame = a.seal(b"from a", b"ad").unwrap();
        assert_eq!(b.open_frame(&frame, b"ad").unwrap().unwrap(), b"from a");

        let frame = b.seal(b"from b", b"ad").unwrap();
        assert_eq!(a.open_frame(&frame, b"ad").unwrap().unwrap(), b"from b");
    }

    #[test]
    fn replayed_counter_is_dropped() {
        let (mut a, mut b) = pair();

        // Counters 0..=3 accepted in order.
        let frames: Vec<_> = (0..4).map(|i| a.seal(&[i as u8], b"").unwrap()).collect();
        for frame in &frames {
            b.open_frame(frame, b"").unwrap();
        }

        // Resending counter 2 drops.
        assert!(matches!(
            b.open_frame(&frames[2], b"").unwrap_err(),
            NetworkError::ReplayDrop
        ));
    }

    #[test]
    fn window_accepts_late_frames_once() {
        let (mut a, mut b) = pair();

        let early: Vec<_> = (0..4).map(|i| a.seal(&[i as u8], b"").unwrap()).collect();
        for frame in &early {
            b.open_frame(frame, b"").unwrap();
        }

        // Jump the counter ahead to 100.
        let mut skipped = Vec::new();
        for i in 4..=100u64 {
            let frame = a.seal(&[0u8], b"").unwrap();
            if i == 5 || i == 100 {
                skipped.push((i, frame));
            }
        }
        let (_, frame_100) = skipped.pop().unwrap();
        let (_, frame_5) = skipped.pop().unwrap();

        // 100 arrives first, then the late 5 is still inside the window.
        assert!(b.open_frame(&frame_100, b"").unwrap().is_some());
        assert!(b.open_frame(&frame_5, b"").unwrap().is_some());

        // Replaying either now fails.
        assert!(matches!(
            b.open_frame(&frame_5, b"").unwrap_err(),
            NetworkError::ReplayDrop
        ));
        assert!(matches!(
            b.open_frame(&early[2], b"").unwrap_err(),
            NetworkError::ReplayDrop
        ));
    }

    #[test]
    fn rekey_rolls_generation_and_keeps_flowing() {
        let (a, b) = pair();
        let mut a = a.with_rekey_thresholds(1, Duration::from_secs(3600));
        let mut b = b;

        // First frame trips the byte threshold.
        let frame = a.seal(b"before rotation", b"").unwrap();
        b.open_frame(&frame, b"").unwrap();

        let rekey = a.maybe_rekey().unwrap().expect("rotation due");
        assert_eq!(rekey.frame_type, FrameType::Rekey);
        assert!(b.open_frame(&rekey, b"").unwrap().is_none());

        // New generation traffic decrypts on the rotated key.
        let frame = a.seal(b"after rotation", b"").unwrap();
        assert_eq!(frame.generation, 1);
        assert_eq!(frame.counter, 0);
        assert_eq!(b.open_frame(&frame, b"").unwrap().unwrap(), b"after rotation");
    }

    #[test]
    fn old_generation_frames_still_open_during_grace() {
        let (a, b) = pair();
        let mut a = a.with_rekey_thresholds(1, Duration::from_secs(3600));
        let mut b = b;

        let in_flight = a.seal(b"old gen, in flight", b"").unwrap();
        let rekey = a.maybe_rekey().unwrap().expect("rotation due");
        b.open_frame(&rekey, b"").unwrap();

        // The pre-rotation frame arrives after the rekey was processed.
        assert_eq!(
            b.open_frame(&in_flight, b"").unwrap().unwrap(),
            b"old gen, in flight"
        );
    }

    #[test]
    fn closed_channel_refuses_traffic() {
        let (mut a, _) = pair();
        a.close("test");
        assert!(matches!(
            a.seal(b"x", b"").unwrap_err(),
            NetworkError::ChannelClosed(_)
        ));
        assert_eq!(a.state(), ChannelState::Closed);
    }

    #[test]
    fn tampered_frame_is_a_crypto_failure() {
        let (mut a, mut b) = pair();
        let mut frame = a.seal(b"payload", b"ad").unwrap();
        frame.ciphertext[0] ^= 1;
        assert!(matches!(
            b.open_frame(&frame, b"ad").unwrap_err(),
            NetworkError::Crypto(_)
        ));
    }

    #[test]
    fn manager_gates_on_trust_level() {
        let trust = Arc::new(TrustStore::new("node-a".into()));
        let manager = ChannelManager::new("node-a".into(), trust.clone());

        let b_keys = AgreementKeyPair::from_seed(&[2u8; 32]).unwrap();
        let a_keys = AgreementKeyPair::from_seed(&[1u8; 32]).unwrap();
        let shared = a_keys.agree(&b_keys.public_bytes()).unwrap();

        // Unknown peer refused.
        assert!(matches!(
            manager.open("node-b", &shared).unwrap_err(),
            NetworkError::InsufficientTrust(_)
        ));

        trust
            .add_peer_local(
                "node-b".into(),
                [0u8; 32],
                b_keys.public_bytes(),
                TrustLevel::Low,
            )
            .unwrap();
        manager.open("node-b", &shared).unwrap();
        assert!(manager.is_open("node-b"));
    }
}
