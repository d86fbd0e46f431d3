//! Process-wide counters, shared via `Arc` the same way the teacher threads
//! its `event::EndpointPublisher` through connection state - minus the
//! generic subscriber machinery, since this crate has exactly one consumer
//! (a periodic log line) instead of a pluggable event API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Metrics {
    pub checksum_failures: AtomicU64,
    pub decode_failures: AtomicU64,
    pub unknown_packets: AtomicU64,
    pub dedup_hits: AtomicU64,
    pub ack_timeouts: AtomicU64,
    pub admission_rejections: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_checksum_failures(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_packets(&self) {
        self.unknown_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dedup_hits(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ack_timeouts(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_admission_rejections(&self) {
        self.admission_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub checksum_failures: u64,
    pub decode_failures: u64,
    pub unknown_packets: u64,
    pub dedup_hits: u64,
    pub ack_timeouts: u64,
    pub admission_rejections: u64,
}
