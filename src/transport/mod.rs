//! Reliable delivery, ack matching, dedup, and heartbeat liveness for a
//! single connection.
//!
//! Grounded on `s2n-quic-dc`'s stream-level send/receive split
//! (`stream/send/state.rs` tracks one outstanding send and its retransmit
//! budget; `stream/recv/dispatch` routes inbound frames to whichever local
//! state they resolve) - generalized here to cover four ack types instead of
//! one, and to a much shorter fixed retry budget appropriate to a LAN link
//! instead of a congestion-controlled WAN one. Owned entirely by the
//! connection task that holds it; never shared across connections, so no
//! `Arc`/lock is needed around the pending-send state itself.

mod dedup;
mod pending;

pub use dedup::{DedupCache, Fingerprint};
pub use pending::{AckKind, PendingSend};

use crate::codec::{self, Endpoint, Packet};
use crate::error::{Error, Kind};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{trace, warn};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(128);
pub const DEFAULT_ACK_RETRIES: u32 = 3;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEDUP_CACHE_CAPACITY: usize = 1024;
pub const DEDUP_TTL: Duration = Duration::from_secs(120);

/// `max(3 * ack_timeout, 10s)` per the liveness rule: a link slow enough to
/// need the full retry budget for a single send still shouldn't be declared
/// dead on one missed heartbeat.
pub fn heartbeat_liveness_timeout(ack_timeout: Duration) -> Duration {
    (ack_timeout * 3).max(Duration::from_secs(10))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A `DataAck` with a non-empty payload, or a `DataAck` immediately
    /// preceded in the same read by a `StatusBroadcast` for the same
    /// endpoint - the peer changed device state as a side effect.
    Acked,
    /// A bare, zero-payload ack. Not a transport failure: the command was
    /// received and is valid, it just didn't change anything observable.
    PureAck,
}

#[derive(Debug, Clone, Copy)]
pub struct SendOpts {
    pub ack_timeout: Duration,
    pub ack_retries: u32,
}

impl Default for SendOpts {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ack_retries: DEFAULT_ACK_RETRIES,
        }
    }
}

/// What the connection's read loop should do with a decoded inbound packet
/// once Transport has had first refusal on it.
pub enum RoutedEvent {
    /// Ack/heartbeat traffic fully handled here; nothing left to do.
    Consumed,
    /// Genuinely new traffic (or the first copy of a deduped broadcast) for
    /// the Connection state machine / Bridge Registry to act on.
    Deliver(Packet),
}

/// Per-connection reliable-send and inbound-routing state.
pub struct Transport {
    next_msg_id: u16,
    pending_by_msg_id: HashMap<u16, PendingSend>,
    pending_fifo: HashMap<u8, VecDeque<PendingSend>>,
    dedup: DedupCache,
    out_tx: mpsc::Sender<Vec<u8>>,
    last_heartbeat_rx: Instant,
    last_status_endpoint: Option<Endpoint>,
}

impl Transport {
    pub fn new(out_tx: mpsc::Sender<Vec<u8>>, seed_msg_id: u16) -> Self {
        Self {
            next_msg_id: seed_msg_id,
            pending_by_msg_id: HashMap::new(),
            pending_fifo: HashMap::new(),
            dedup: DedupCache::new(DEDUP_CACHE_CAPACITY, DEDUP_TTL),
            out_tx,
            last_heartbeat_rx: Instant::now(),
            last_status_endpoint: None,
        }
    }

    pub fn fresh_msg_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        id
    }

    /// Register `wire` as an outstanding reliable send and transmit it once.
    /// Returns a receiver that resolves when a matching ack arrives via
    /// [`Transport::on_packet`] or the retry budget is exhausted by
    /// [`Transport::sweep_expired`].
    ///
    /// Deliberately does *not* await the ack itself: that would hold `&mut
    /// self` for the lifetime of the wait, which would block the very
    /// `on_packet` call needed to resolve it when both run from the same
    /// connection task's `select!` loop. Registration and the first
    /// transmit are the only work done under the borrow; `out_tx.send` only
    /// needs `&self` underneath; so the borrow clears the moment this
    /// function returns the receiver.
    pub async fn begin_send(
        &mut self,
        wire: Vec<u8>,
        ack: AckKind,
        opts: SendOpts,
    ) -> Result<oneshot::Receiver<Result<SendOutcome, Error>>, Error> {
        let msg_id = codec::extract_msg_id(&wire);
        let (tx, rx) = oneshot::channel();

        self.register(wire.clone(), ack, msg_id, opts.ack_retries, opts.ack_timeout, tx);
        if self.out_tx.send(wire).await.is_err() {
            self.take_pending(ack, msg_id);
            return Err(Kind::ConnectionLost.err());
        }

        Ok(rx)
    }

    fn register(
        &mut self,
        wire: Vec<u8>,
        ack: AckKind,
        msg_id: Option<u16>,
        attempts_remaining: u32,
        ack_timeout: Duration,
        tx: oneshot::Sender<Result<SendOutcome, Error>>,
    ) {
        let pending = PendingSend::new(wire, ack, attempts_remaining, ack_timeout, tx);
        if ack.is_keyed() {
            let msg_id = msg_id.expect("DataAck-keyed sends always carry a msg_id");
            self.pending_by_msg_id.insert(msg_id, pending);
        } else {
            self.pending_fifo.entry(ack.type_byte()).or_default().push_back(pending);
        }
    }

    fn take_pending(&mut self, ack: AckKind, msg_id: Option<u16>) -> Option<PendingSend> {
        if ack.is_keyed() {
            msg_id.and_then(|id| self.pending_by_msg_id.remove(&id))
        } else {
            self.pending_fifo.get_mut(&ack.type_byte()).and_then(|q| q.pop_front())
        }
    }

    /// Walk every outstanding send whose deadline has passed: retransmit it
    /// and reset its deadline if it still has retries left, or complete it
    /// with `AckTimeout` and drop it otherwise. Returns the wire bytes that
    /// need retransmitting - the caller (the connection task's `select!`
    /// loop, on a periodic tick) writes them via `out_tx`, since that's the
    /// only actual I/O this needs and doing it here would hold `&mut self`
    /// longer than the bookkeeping requires.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut retransmits = Vec::new();

        let mut timed_out = Vec::new();
        for (msg_id, pending) in self.pending_by_msg_id.iter_mut() {
            if pending.deadline > now {
                continue;
            }
            if pending.attempts_remaining <= 1 {
                timed_out.push(*msg_id);
            } else {
                pending.attempts_remaining -= 1;
                pending.deadline = now + pending.ack_timeout;
                retransmits.push(pending.wire.clone());
            }
        }
        for msg_id in timed_out {
            if let Some(mut pending) = self.pending_by_msg_id.remove(&msg_id) {
                pending.complete(Err(Kind::AckTimeout.err()));
            }
        }

        for queue in self.pending_fifo.values_mut() {
            let mut timed_out = Vec::new();
            for (idx, pending) in queue.iter_mut().enumerate() {
                if pending.deadline > now {
                    continue;
                }
                if pending.attempts_remaining <= 1 {
                    timed_out.push(idx);
                } else {
                    pending.attempts_remaining -= 1;
                    pending.deadline = now + pending.ack_timeout;
                    retransmits.push(pending.wire.clone());
                }
            }
            for idx in timed_out.into_iter().rev() {
                if let Some(mut pending) = queue.remove(idx) {
                    pending.complete(Err(Kind::AckTimeout.err()));
                }
            }
        }

        retransmits
    }

    /// Feed one decoded inbound packet through ack-matching and dedup. The
    /// caller is expected to call this once per packet in the order the
    /// Framer produced them, so a compound status+ack reply (two packets
    /// back to back in the same read) sees the status first.
    pub fn on_packet(&mut self, packet: Packet, raw: &[u8]) -> RoutedEvent {
        match &packet {
            Packet::HeartbeatAck => {
                // The gateway answers heartbeats, it doesn't send them, so
                // there's nothing in our tables for this to resolve; a bridge
                // that sends one anyway is harmless to ignore.
                trace!("received unexpected heartbeat ack");
                RoutedEvent::Consumed
            }
            Packet::Heartbeat => {
                self.last_heartbeat_rx = Instant::now();
                RoutedEvent::Deliver(packet)
            }
            Packet::HelloAck => {
                self.resolve_fifo(codec::TYPE_HELLO_ACK, SendOutcome::PureAck);
                RoutedEvent::Consumed
            }
            Packet::InfoAck => {
                self.resolve_fifo(codec::TYPE_INFO_ACK, SendOutcome::PureAck);
                RoutedEvent::Consumed
            }
            Packet::StatusAck => {
                self.resolve_fifo(codec::TYPE_STATUS_ACK, SendOutcome::PureAck);
                RoutedEvent::Consumed
            }
            Packet::DataAck { endpoint, msg_id, payload } => {
                let outcome = if payload.is_empty() && self.last_status_endpoint != Some(*endpoint) {
                    SendOutcome::PureAck
                } else {
                    SendOutcome::Acked
                };
                self.last_status_endpoint = None;
                if let Some(mut p) = self.pending_by_msg_id.remove(msg_id) {
                    p.complete(Ok(outcome));
                }
                RoutedEvent::Consumed
            }
            Packet::StatusBroadcast { endpoint, msg_id, payload } => {
                // 0x83's endpoint is the emitting bridge's own id (1:1 with
                // this connection), so device-level (endpoint+msg_id)
                // fingerprinting is what distinguishes distinct events here.
                let _ = payload;
                let fp = Fingerprint::device(codec::TYPE_STATUS_BROADCAST, *endpoint, *msg_id);
                if self.dedup.observe(fp) {
                    RoutedEvent::Deliver(packet)
                } else {
                    trace!(endpoint = ?endpoint, "dropping duplicate status broadcast");
                    RoutedEvent::Consumed
                }
            }
            Packet::DataChannel { endpoint, payload, .. } => {
                // 0x73's endpoint is the shared mesh-coordinator id, so the
                // same mesh event arrives with this same payload but a
                // distinct msg_id from every bridge in the mesh - fingerprint
                // on the payload hash instead. This is also the status-prefix
                // half of a compound command reply, so track its endpoint for
                // the immediately following DataAck to classify against.
                self.last_status_endpoint = Some(*endpoint);
                let fp = Fingerprint::mesh(codec::TYPE_DATA_CHANNEL, payload);
                if self.dedup.observe(fp) {
                    RoutedEvent::Deliver(packet)
                } else {
                    RoutedEvent::Consumed
                }
            }
            Packet::Handshake { .. } | Packet::DeviceInfo { .. } => {
                let _ = raw;
                RoutedEvent::Deliver(packet)
            }
        }
    }

    fn resolve_fifo(&mut self, ack_type: u8, outcome: SendOutcome) {
        if let Some(mut p) = self.pending_fifo.get_mut(&ack_type).and_then(|q| q.pop_front()) {
            p.complete(Ok(outcome));
        } else {
            warn!(ack_type, "received ack with no matching pending send");
        }
    }

    /// Fail every outstanding send with `connection_lost`; called once when
    /// the connection's read/write loop is tearing down.
    pub fn fail_all_pending(&mut self) {
        for (_, mut p) in self.pending_by_msg_id.drain() {
            p.complete(Err(Kind::ConnectionLost.err()));
        }
        for (_, mut q) in self.pending_fifo.drain() {
            while let Some(mut p) = q.pop_front() {
                p.complete(Err(Kind::ConnectionLost.err()));
            }
        }
    }

    pub fn last_heartbeat_rx(&self) -> Instant {
        self.last_heartbeat_rx
    }

    pub fn is_stale(&self, liveness_timeout: Duration) -> bool {
        self.last_heartbeat_rx.elapsed() > liveness_timeout
    }
}
