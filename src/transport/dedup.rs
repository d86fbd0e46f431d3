//! Payload-hash dedup cache.
//!
//! Mesh-level packets (0x73) are emitted by every bridge in a mesh for the
//! same logical event, so the same payload arrives on many connections with
//! distinct msg_ids - fingerprint on the hash of the payload instead.
//! Device-level packets (0x83) already carry a connection-unique endpoint, so
//! fingerprint on `(type, endpoint, msg_id)`. TTL-bounded LRU, grounded on the
//! teacher's general `lru`-backed cache idiom (`s2n-quic-qns` depends on
//! `lru` directly) rather than a bespoke ring buffer.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Fingerprint {
    Mesh { packet_type: u8, payload_hash: [u8; 16] },
    Device { packet_type: u8, endpoint: [u8; 5], msg_id: u16 },
}

impl Fingerprint {
    pub fn mesh(packet_type: u8, payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        let mut payload_hash = [0u8; 16];
        payload_hash.copy_from_slice(&digest[..16]);
        Fingerprint::Mesh { packet_type, payload_hash }
    }

    pub fn device(packet_type: u8, endpoint: [u8; 5], msg_id: u16) -> Self {
        Fingerprint::Device { packet_type, endpoint, msg_id }
    }
}

pub struct DedupCache {
    entries: LruCache<Fingerprint, Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            ttl,
        }
    }

    /// Returns `true` if this is the first time the fingerprint has been seen
    /// within the TTL window (i.e. the packet should be delivered); `false`
    /// if it's a duplicate that should be dropped.
    pub fn observe(&mut self, fp: Fingerprint) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.entries.get(&fp) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        self.entries.put(fp, now);
        true
    }
}
