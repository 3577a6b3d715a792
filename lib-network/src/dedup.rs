//! Envelope nonce dedup window
//!
//! Fixed-capacity, time-evicted record of `(sender, nonce)` pairs.
//! Guarantees at-most-once acceptance per message identifier for at
//! least the maximum expected hop lifetime. The LRU bound caps memory;
//! entries older than the window no longer count as seen.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use lib_trust::PeerId;

pub const DEFAULT_WINDOW_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_WINDOW_CAPACITY: usize = 8192;

pub struct NonceWindow {
    seen: LruCache<(PeerId, [u8; 16]), Instant>,
    ttl: Duration,
}

impl NonceWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("nonzero")),
            ttl,
        }
    }

    /// Record a pair; returns `false` when it was already observed
    /// within the window.
    pub fn observe(&mut self, from: &str, nonce: [u8; 16]) -> bool {
        let key = (from.to_string(), nonce);
        if let Some(at) = self.seen.get(&key) {
            if at.elapsed() <= self.ttl {
                return false;
            }
        }
        self.seen.put(key, Instant::now());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_TTL, DEFAULT_WINDOW_CAPACITY)
    }
}
