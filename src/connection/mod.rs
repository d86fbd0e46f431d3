//! Per-connection protocol state machine.
//!
//! One bridge TCP connection, one `Connection`. Grounded on the shape of
//! `s2n-quic-dc`'s connection lifecycle (accept -> handshake -> open ->
//! closing, each transition gated on a specific packet/timeout and nothing
//! else reachable from the wrong state) but collapsed to this protocol's
//! four real states instead of QUIC's full handshake state space.

use crate::codec::{self, Endpoint, Packet};
use crate::error::{Error, Kind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::warn;

/// Bridge reports go quiet for a few seconds around a Wi-Fi reassociation
/// all the time; only treat a mesh member as offline after this many
/// consecutive offline-status reports in a row, matching the "don't flap
/// northbound state" goal.
pub const OFFLINE_DEBOUNCE_THRESHOLD: u32 = 3;

pub const DEFAULT_HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(320);
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 6;

/// First byte of a status broadcast payload: `0x00` means the reported
/// device/mesh member went offline, anything else is an online status
/// update. A narrower convention than the real protocol likely uses, but
/// the one piece of payload semantics this layer needs to make debounce
/// decisions without fully parsing the command payload.
pub const STATUS_PAYLOAD_OFFLINE: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accepted,
    Handshaking,
    Operational,
    Closing,
    Closed,
}

/// Side effects the connection task should perform in response to inbound
/// traffic or a timer tick. Kept data-only so the state machine itself stays
/// free of I/O and is easy to test without a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Vec<u8>),
    Admit { endpoint: Endpoint },
    MeshMembership { endpoint: Endpoint, mesh_coordinator_id: Endpoint },
    DeliverStatus { endpoint: Endpoint, msg_id: u16, payload: Vec<u8>, now_offline: bool },
    DeliverData { endpoint: Endpoint, msg_id: u16, payload: Vec<u8> },
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeTimeout,
    HeartbeatTimeout,
    ProtocolViolation,
    PeerClosed,
}

pub struct Connection {
    pub peer_addr: SocketAddr,
    state: State,
    endpoint: Option<Endpoint>,
    accepted_at: Instant,
    handshake_attempts_remaining: u32,
    last_heartbeat: Instant,
    offline_count: u32,
}

impl Connection {
    pub fn new(peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            peer_addr,
            state: State::Accepted,
            endpoint: None,
            accepted_at: now,
            handshake_attempts_remaining: DEFAULT_HANDSHAKE_RETRIES,
            last_heartbeat: now,
            offline_count: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
    }

    /// Drive one decoded inbound packet through the state machine. Packets
    /// that arrive out of order for the current state are a protocol
    /// violation, not silently ignored - a bridge skipping the handshake is
    /// either buggy or hostile and either way shouldn't be humored.
    pub fn on_packet(&mut self, packet: Packet) -> Result<Vec<Action>, Error> {
        match (&self.state, packet) {
            (State::Accepted, Packet::Handshake { endpoint, .. }) => {
                self.endpoint = Some(endpoint);
                self.state = State::Handshaking;
                self.handshake_attempts_remaining = DEFAULT_HANDSHAKE_RETRIES;
                Ok(vec![Action::Admit { endpoint }, Action::Send(codec::encode_hello_ack())])
            }
            (State::Handshaking, Packet::DeviceInfo { endpoint, .. }) => {
                if Some(endpoint) != self.endpoint {
                    return Err(Kind::ProtocolViolation.err());
                }
                self.state = State::Operational;
                self.last_heartbeat = Instant::now();
                Ok(vec![Action::Send(codec::encode_info_ack())])
            }
            (State::Operational, Packet::StatusBroadcast { endpoint, msg_id, payload }) => {
                // `endpoint` here is the emitting bridge's own id (1:1 with
                // this connection), not a mesh-coordinator id - it carries no
                // mesh membership information.
                let now_offline = self.observe_status(&payload);
                let actions = vec![
                    Action::Send(codec::encode_status_ack()),
                    Action::DeliverStatus { endpoint, msg_id, payload, now_offline },
                ];
                Ok(actions)
            }
            (State::Operational, Packet::Heartbeat) => {
                self.last_heartbeat = Instant::now();
                Ok(vec![Action::Send(codec::encode_heartbeat_ack())])
            }
            (State::Operational, Packet::DataChannel { endpoint, msg_id, payload }) => {
                // An inbound 0x73 is a bridge relaying a mesh-wide event, not
                // a reply to a gateway-issued command (those resolve in the
                // transport's ack path and never reach here). `endpoint` is
                // the shared mesh-coordinator id - the first one seen on this
                // connection tells the registry which mesh this bridge is in.
                let bridge_endpoint = self.endpoint.unwrap_or(endpoint);
                Ok(vec![
                    Action::MeshMembership { endpoint: bridge_endpoint, mesh_coordinator_id: endpoint },
                    Action::DeliverData { endpoint, msg_id, payload },
                ])
            }
            (state, packet) => {
                warn!(?state, type_byte = packet.type_byte(), "packet not valid for current connection state");
                Err(Kind::ProtocolViolation.err())
            }
        }
    }

    /// Treat the first payload byte as a mesh-member liveness marker and
    /// debounce `offline` reports; returns `true` only on the transition
    /// that should actually be surfaced northbound (the Nth consecutive
    /// offline report).
    fn observe_status(&mut self, payload: &[u8]) -> bool {
        let is_offline = payload.first() == Some(&STATUS_PAYLOAD_OFFLINE);
        if is_offline {
            self.offline_count += 1;
            self.offline_count >= OFFLINE_DEBOUNCE_THRESHOLD
        } else {
            self.offline_count = 0;
            false
        }
    }

    /// Call periodically (e.g. once per heartbeat interval) to surface
    /// timeout-driven closes. `liveness_timeout` should come from
    /// [`crate::transport::heartbeat_liveness_timeout`].
    pub fn tick(&mut self, liveness_timeout: Duration) -> Option<Action> {
        match self.state {
            State::Accepted | State::Handshaking => {
                let elapsed = self.accepted_at.elapsed();
                let deadline = DEFAULT_HANDSHAKE_RETRY_INTERVAL * DEFAULT_HANDSHAKE_RETRIES;
                if elapsed > deadline {
                    self.state = State::Closing;
                    Some(Action::Close(CloseReason::HandshakeTimeout))
                } else {
                    None
                }
            }
            State::Operational => {
                if self.last_heartbeat.elapsed() > liveness_timeout {
                    self.state = State::Closing;
                    Some(Action::Close(CloseReason::HeartbeatTimeout))
                } else {
                    None
                }
            }
            State::Closing | State::Closed => None,
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4567)
    }

    fn endpoint() -> Endpoint {
        [0x10, 0x20, 0x30, 0x40, 0x50]
    }

    #[test]
    fn full_handshake_then_operational_traffic() {
        let mut conn = Connection::new(addr());
        let actions = conn
            .on_packet(Packet::Handshake { endpoint: endpoint(), auth_code: vec![] })
            .unwrap();
        assert_eq!(conn.state(), State::Handshaking);
        assert!(actions.contains(&Action::Admit { endpoint: endpoint() }));

        let actions = conn
            .on_packet(Packet::DeviceInfo { endpoint: endpoint(), payload: vec![] })
            .unwrap();
        assert_eq!(conn.state(), State::Operational);
        assert_eq!(actions, vec![Action::Send(codec::encode_info_ack())]);
    }

    #[test]
    fn data_channel_before_handshake_is_a_protocol_violation() {
        let mut conn = Connection::new(addr());
        let err = conn
            .on_packet(Packet::DataChannel { endpoint: endpoint(), msg_id: 1, payload: vec![] })
            .unwrap_err();
        assert!(matches!(err.kind(), Kind::ProtocolViolation));
    }

    #[test]
    fn offline_status_debounces_before_surfacing() {
        let mut conn = Connection::new(addr());
        conn.on_packet(Packet::Handshake { endpoint: endpoint(), auth_code: vec![] }).unwrap();
        conn.on_packet(Packet::DeviceInfo { endpoint: endpoint(), payload: vec![] }).unwrap();

        let mut last_flag = false;
        for _ in 0..OFFLINE_DEBOUNCE_THRESHOLD {
            let actions = conn
                .on_packet(Packet::StatusBroadcast {
                    endpoint: endpoint(),
                    msg_id: 1,
                    payload: vec![STATUS_PAYLOAD_OFFLINE],
                })
                .unwrap();
            last_flag = actions.iter().any(|a| matches!(a, Action::DeliverStatus { now_offline: true, .. }));
        }
        assert!(last_flag, "third consecutive offline report should surface");
    }

    #[test]
    fn online_report_resets_the_debounce_counter() {
        let mut conn = Connection::new(addr());
        conn.on_packet(Packet::Handshake { endpoint: endpoint(), auth_code: vec![] }).unwrap();
        conn.on_packet(Packet::DeviceInfo { endpoint: endpoint(), payload: vec![] }).unwrap();

        conn.on_packet(Packet::StatusBroadcast { endpoint: endpoint(), msg_id: 1, payload: vec![STATUS_PAYLOAD_OFFLINE] })
            .unwrap();
        conn.on_packet(Packet::StatusBroadcast { endpoint: endpoint(), msg_id: 2, payload: vec![0x01] })
            .unwrap();
        assert_eq!(conn.offline_count, 0);
    }

    #[test]
    fn heartbeat_timeout_closes_operational_connection() {
        let mut conn = Connection::new(addr());
        conn.on_packet(Packet::Handshake { endpoint: endpoint(), auth_code: vec![] }).unwrap();
        conn.on_packet(Packet::DeviceInfo { endpoint: endpoint(), payload: vec![] }).unwrap();
        let action = conn.tick(Duration::from_secs(0));
        assert!(matches!(action, Some(Action::Close(CloseReason::HeartbeatTimeout))));
        assert_eq!(conn.state(), State::Closing);
    }
}
