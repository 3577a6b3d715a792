//! Trust store: canonical peer set plus update ingest/produce
//!
//! Discipline: single writer task per key, many readers. The store keeps
//! per-issuer chain heads, a bounded dedup cache for update nonces, a
//! small reorder buffer for updates that arrive ahead of their chain
//! position, and per-peer violation counters feeding rate budgets.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TrustError;
use crate::peer::{PeerId, TrustLevel, TrustPeer};
use crate::update::{
    decode_add_payload, decode_level_payload, TrustOp, TrustUpdate, GENESIS_HASH,
};
use crate::Result;

/// Nonces remembered for replay detection.
const DEDUP_CAPACITY: usize = 1024;

/// Per-issuer reorder window for early arrivals.
const REORDER_WINDOW: usize = 32;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrustSnapshot {
    pub peers: Vec<TrustPeer>,
    pub assertions: Vec<(PeerId, PeerId, TrustLevel)>,
    pub own_seq: u64,
    pub own_hash: [u8; 32],
}

struct Inner {
    peers: HashMap<PeerId, TrustPeer>,
    /// target -> issuer -> asserted level
    assertions: HashMap<PeerId, HashMap<PeerId, TrustLevel>>,
    own_seq: u64,
    own_hash: [u8; 32],
    reorder: HashMap<PeerId, BTreeMap<u64, TrustUpdate>>,
    violations: HashMap<PeerId, u32>,
}

pub struct TrustStore {
    self_id: PeerId,
    inner: RwLock<Inner>,
    dedup: Mutex<LruCache<(PeerId, [u8; 16]), ()>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TrustStore {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                assertions: HashMap::new(),
                own_seq: 0,
                own_hash: GENESIS_HASH,
                reorder: HashMap::new(),
                violations: HashMap::new(),
            }),
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).expect("nonzero"),
            )),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn get(&self, id: &str) -> Option<TrustPeer> {
        self.inner.read().peers.get(id).cloned()
    }

    pub fn list(&self) -> Vec<TrustPeer> {
        let mut peers: Vec<_> = self.inner.read().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Effective level: highest assertion from the owner or from any
    /// issuer currently at or above `Medium`.
    pub fn level(&self, id: &str) -> TrustLevel {
        self.inner
            .read()
            .peers
            .get(id)
            .map(|p| p.level)
            .unwrap_or(TrustLevel::Unknown)
    }

    pub fn peers_at_or_above(&self, level: TrustLevel) -> Vec<TrustPeer> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.level >= level)
            .cloned()
            .collect()
    }

    pub fn violations(&self, id: &str) -> u32 {
        self.inner.read().violations.get(id).copied().unwrap_or(0)
    }

    /// Owner-initiated insert (control surface). Recorded as a self
    /// assertion; no update chain is involved.
    pub fn add_peer_local(
        &self,
        id: PeerId,
        ed25519_public: [u8; 32],
        x25519_public: [u8; 32],
        level: TrustLevel,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let self_id = self.self_id.clone();
        inner
            .assertions
            .entry(id.clone())
            .or_default()
            .insert(self_id, level);
        let record = inner.peers.entry(id.clone()).or_insert_with(|| TrustPeer {
            id: id.clone(),
            ed25519_public,
            x25519_public,
            level,
            added_at: now_secs(),
            last_seq: 0,
            last_update_hash: GENESIS_HASH,
        });
        record.ed25519_public = ed25519_public;
        record.x25519_public = x25519_public;
        recompute_level(&mut inner, &self.self_id, &id);
        info!(peer = %id, %level, "trust peer added locally");
        Ok(())
    }

    pub fn remove_peer_local(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.peers.remove(id).is_none() {
            return Err(TrustError::UnknownPeer(id.to_string()));
        }
        inner.assertions.remove(id);
        inner.reorder.remove(id);
        info!(peer = %id, "trust peer removed locally");
        Ok(())
    }

    /// Head of our own issuer chain.
    pub fn own_chain_head(&self) -> (u64, [u8; 32]) {
        let inner = self.inner.read();
        (inner.own_seq, inner.own_hash)
    }

    /// Produce the next update on our own chain, sign it, apply it
    /// locally and hand it back for broadcast.
    pub fn produce(
        &self,
        op: TrustOp,
        target: PeerId,
        payload: Vec<u8>,
        sign: impl FnOnce(&[u8]) -> [u8; 64],
    ) -> Result<TrustUpdate> {
        let (seq, prev_hash) = {
            let inner = self.inner.read();
            (inner.own_seq + 1, inner.own_hash)
        };
        let update = TrustUpdate::build(
            seq,
            prev_hash,
            op,
            target,
            payload,
            self.self_id.clone(),
            sign,
        )?;

        let mut inner = self.inner.write();
        apply_op(&mut inner, &self.self_id, &update)?;
        inner.own_seq = update.seq;
        inner.own_hash = update.update_hash();
        debug!(seq = update.seq, "produced trust update");
        Ok(update)
    }

    /// Ingest a peer-issued update: verify signature, enforce replay /
    /// order / chain invariants, apply atomically. `Ok` means the
    /// update (and any parked successors it unblocked) applied; the
    /// caller should rebroadcast it once to peers at or above `Medium`
    /// with a hop budget of 4. Any arrival out of sequence is an
    /// `OutOfOrder` rejection; early arrivals are additionally retained
    /// in a bounded reorder buffer and drained, without rebroadcast,
    /// once the gap fills.
    pub fn ingest(&self, update: TrustUpdate) -> Result<()> {
        let issuer_key = {
            let inner = self.inner.read();
            match inner.peers.get(&update.issuer) {
                Some(peer) => peer.ed25519_public,
                None => {
                    drop(inner);
                    self.count_violation(&update.issuer);
                    return Err(TrustError::UnknownIssuer(update.issuer.clone()));
                }
            }
        };

        if let Err(e) = update.verify(&issuer_key) {
            self.count_violation(&update.issuer);
            warn!(issuer = %update.issuer, "trust update signature rejected");
            return Err(e.into());
        }

        {
            let mut dedup = self.dedup.lock();
            let key = (update.issuer.clone(), update.nonce);
            if dedup.contains(&key) {
                self.count_violation(&update.issuer);
                return Err(TrustError::ReplayDrop);
            }
            dedup.put(key, ());
        }

        let mut inner = self.inner.write();
        let last_seq = inner
            .peers
            .get(&update.issuer)
            .map(|p| p.last_seq)
            .unwrap_or(0);

        if update.seq <= last_seq {
            drop(inner);
            self.count_violation(&update.issuer);
            return Err(TrustError::OutOfOrder {
                last_seq,
                got: update.seq,
            });
        }

        if update.seq > last_seq + 1 {
            let got = update.seq;
            let issuer = update.issuer.clone();
            let buffer = inner.reorder.entry(issuer.clone()).or_default();
            let mut retained = true;
            if buffer.len() >= REORDER_WINDOW {
                // Keep the entries closest to the gap.
                match buffer.iter().next_back() {
                    Some((&highest, _)) if update.seq < highest => {
                        buffer.remove(&highest);
                    }
                    _ => retained = false,
                }
            }
            if retained {
                buffer.insert(update.seq, update);
            } else {
                debug!(issuer = %issuer, seq = got, "reorder window full, dropped");
            }
            drop(inner);
            self.count_violation(&issuer);
            return Err(TrustError::OutOfOrder { last_seq, got });
        }

        self.apply_chained(&mut inner, update)?;

        // Drain any parked successors now that the gap moved.
        loop {
            let mut next = None;
            for (issuer, buffer) in inner.reorder.iter() {
                let head = inner.peers.get(issuer).map(|p| p.last_seq).unwrap_or(0);
                if buffer.contains_key(&(head + 1)) {
                    next = Some((issuer.clone(), head + 1));
                    break;
                }
            }
            let Some((issuer, seq)) = next else { break };
            let Some(parked) = inner
                .reorder
                .get_mut(&issuer)
                .and_then(|buffer| buffer.remove(&seq))
            else {
                break;
            };
            if let Err(e) = self.apply_chained(&mut inner, parked) {
                warn!(issuer = %issuer, "parked trust update failed: {e}");
            }
        }

        Ok(())
    }

    /// Chain-link check plus atomic apply; caller holds the write lock.
    fn apply_chained(&self, inner: &mut Inner, update: TrustUpdate) -> Result<()> {
        let (last_seq, last_hash) = inner
            .peers
            .get(&update.issuer)
            .map(|p| (p.last_seq, p.last_update_hash))
            .ok_or_else(|| TrustError::UnknownIssuer(update.issuer.clone()))?;

        debug_assert_eq!(update.seq, last_seq + 1);
        let expected_prev = if last_seq == 0 { GENESIS_HASH } else { last_hash };
        if update.prev_hash != expected_prev {
            inner
                .violations
                .entry(update.issuer.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            return Err(TrustError::ChainBroken { seq: update.seq });
        }

        apply_op(inner, &self.self_id, &update)?;

        let hash = update.update_hash();
        if let Some(issuer) = inner.peers.get_mut(&update.issuer) {
            issuer.last_seq = update.seq;
            issuer.last_update_hash = hash;
        }
        debug!(issuer = %update.issuer, seq = update.seq, "trust update applied");
        Ok(())
    }

    fn count_violation(&self, id: &str) {
        let mut inner = self.inner.write();
        inner
            .violations
            .entry(id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    pub fn to_snapshot(&self) -> TrustSnapshot {
        let inner = self.inner.read();
        let mut assertions = Vec::new();
        for (target, by_issuer) in &inner.assertions {
            for (issuer, level) in by_issuer {
                assertions.push((target.clone(), issuer.clone(), *level));
            }
        }
        assertions.sort();
        TrustSnapshot {
            peers: {
                let mut peers: Vec<_> = inner.peers.values().cloned().collect();
                peers.sort_by(|a, b| a.id.cmp(&b.id));
                peers
            },
            assertions,
            own_seq: inner.own_seq,
            own_hash: inner.own_hash,
        }
    }

    pub fn from_snapshot(self_id: PeerId, snapshot: TrustSnapshot) -> Self {
        let store = Self::new(self_id);
        {
            let mut inner = store.inner.write();
            for peer in snapshot.peers {
                inner.peers.insert(peer.id.clone(), peer);
            }
            for (target, issuer, level) in snapshot.assertions {
                inner
                    .assertions
                    .entry(target)
                    .or_default()
                    .insert(issuer, level);
            }
            inner.own_seq = snapshot.own_seq;
            inner.own_hash = snapshot.own_hash;
        }
        store
    }
}

/// Apply one operation's effect on records and assertions, then refresh
/// the target's effective level.
fn apply_op(inner: &mut Inner, self_id: &str, update: &TrustUpdate) -> Result<()> {
    match update.op {
        TrustOp::Add => {
            let (ed, x, level) = decode_add_payload(&update.payload)?;
            if let Some(existing) = inner.peers.get(&update.target) {
                // Key substitution through an Add for a known peer is a
                // protocol violation, not an update.
                if existing.ed25519_public != ed || existing.x25519_public != x {
                    inner
                        .violations
                        .entry(update.issuer.clone())
                        .and_modify(|c| *c += 1)
                        .or_insert(1);
                    return Err(TrustError::Malformed(
                        "add payload conflicts with known peer keys".into(),
                    ));
                }
            }
            inner
                .assertions
                .entry(update.target.clone())
                .or_default()
                .insert(update.issuer.clone(), level);
            inner
                .peers
                .entry(update.target.clone())
                .or_insert_with(|| TrustPeer {
                    id: update.target.clone(),
                    ed25519_public: ed,
                    x25519_public: x,
                    level,
                    added_at: now_secs(),
                    last_seq: 0,
                    last_update_hash: GENESIS_HASH,
                });
        }
        TrustOp::Remove => {
            if let Some(by_issuer) = inner.assertions.get_mut(&update.target) {
                by_issuer.remove(&update.issuer);
            }
            let drop_record = update.issuer == self_id
                || inner
                    .assertions
                    .get(&update.target)
                    .map(|m| m.is_empty())
                    .unwrap_or(true);
            if drop_record {
                inner.peers.remove(&update.target);
                inner.assertions.remove(&update.target);
                return Ok(());
            }
        }
        TrustOp::SetLevel => {
            let level = decode_level_payload(&update.payload)?;
            // A level assertion for a peer we have no record of still
            // advances the issuer's chain; it takes effect if the
            // record appears later.
            inner
                .assertions
                .entry(update.target.clone())
                .or_default()
                .insert(update.issuer.clone(), level);
        }
    }
    recompute_level(inner, self_id, &update.target);
    Ok(())
}

/// Effective level = max assertion from the owner or from issuers whose
/// own effective level is at least `Medium`.
fn recompute_level(inner: &mut Inner, self_id: &str, target: &str) {
    let Some(by_issuer) = inner.assertions.get(target) else {
        return;
    };
    let mut effective = TrustLevel::Unknown;
    for (issuer, level) in by_issuer {
        let counts = issuer == self_id
            || inner
                .peers
                .get(issuer)
                .map(|p| p.level >= TrustLevel::Medium)
                .unwrap_or(false);
        if counts && *level > effective {
            effective = *level;
        }
    }
    if let Some(peer) = inner.peers.get_mut(target) {
        peer.level = effective;
    }
}
