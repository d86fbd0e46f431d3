//! TCP+TLS accept loop and per-connection task.
//!
//! Grounded on the teacher's netbench driver accept loop
//! (`netbench-driver-tcp-server.rs`: `loop { accept; spawn(handle_connection)
//! }`) rather than `s2n-quic-dc`'s poll-driven worker-pool manager - the
//! spec's own concurrency guidance (OS threads/tasks with channels, no
//! bespoke scheduler) fits the simpler shape much better here.

pub mod tls;

use crate::codec::{self, Packet};
use crate::config::Config;
use crate::connection::{Action, CloseReason, Connection};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Kind};
use crate::framer::Framer;
use crate::metrics::Metrics;
use crate::northbound::{NorthboundEvent, NorthboundPort};
use crate::registry::{ConnectionCommand, SharedRegistry};
use crate::roster::DeviceRoster;
use crate::transport::{self, AckKind, SendOpts, SendOutcome, Transport};

use futures::stream::{FuturesUnordered, StreamExt};
use rand::RngCore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub struct Server {
    config: Arc<Config>,
    registry: SharedRegistry,
    roster: Arc<DeviceRoster>,
    metrics: Arc<Metrics>,
    northbound: Arc<dyn NorthboundPort>,
    tls_acceptor: TlsAcceptor,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        registry: SharedRegistry,
        roster: Arc<DeviceRoster>,
        metrics: Arc<Metrics>,
        northbound: Arc<dyn NorthboundPort>,
    ) -> Result<Self, Error> {
        let tls_acceptor = tls::build_acceptor(
            config.tls_cert_path.as_deref(),
            config.tls_key_path.as_deref(),
        )?;
        Ok(Self { config, registry, roster, metrics, northbound, tls_acceptor })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.registry.clone(), self.roster.clone()).with_command_targets(self.config.command_targets)
    }

    pub async fn run(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "listening for bridge connections");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let _ = stream.set_nodelay(true);

            let id = match self.registry.admit(peer_addr.ip()) {
                Ok(id) => id,
                Err(e) => {
                    self.metrics.inc_admission_rejections();
                    warn!(%peer_addr, error = %e, "rejected connection at admission");
                    continue;
                }
            };

            let tls_acceptor = self.tls_acceptor.clone();
            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let northbound = self.northbound.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                let tls_stream = match tls_acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%peer_addr, error = %e, "tls handshake failed");
                        registry.unregister(id);
                        return;
                    }
                };

                if let Err(e) = handle_connection(id, peer_addr, tls_stream, registry.clone(), metrics, northbound, config).await {
                    debug!(%peer_addr, error = %e, "connection closed with error");
                }
                registry.unregister(id);
            });
        }
    }
}

type TlsStream = tokio_rustls::server::TlsStream<tokio::net::TcpStream>;

async fn handle_connection(
    id: u64,
    peer_addr: std::net::SocketAddr,
    stream: TlsStream,
    registry: SharedRegistry,
    metrics: Arc<Metrics>,
    northbound: Arc<dyn NorthboundPort>,
    config: Arc<Config>,
) -> Result<(), Error> {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.recv_queue_size);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ConnectionCommand>(16);

    let writer_task = tokio::spawn(async move {
        while let Some(wire) = out_rx.recv().await {
            if writer.write_all(&wire).await.is_err() {
                break;
            }
        }
    });

    let seed_msg_id = (rand::thread_rng().next_u32() & 0xFFFF) as u16;
    let mut transport = Transport::new(out_tx.clone(), seed_msg_id);
    let mut conn = Connection::new(peer_addr);
    let mut framer = Framer::new(config.max_packet_size);
    let mut buf = vec![0u8; 4096];
    let send_opts = SendOpts { ack_timeout: config.ack_timeout, ack_retries: config.ack_retries };

    let liveness_timeout = config.heartbeat_timeout();
    let mut heartbeat_tick = tokio::time::interval(config.heartbeat_interval);
    let mut sweep_tick = tokio::time::interval(config.ack_timeout);

    // Replies to dispatcher-issued sends are forwarded out of this set
    // instead of being awaited inline in the `cmd_rx` arm below - awaiting a
    // send there would hold the whole select loop hostage on one borrow of
    // `transport`, starving the `reader.read` arm that's needed to ever feed
    // the matching ack back in.
    let mut pending_acks: FuturesUnordered<AckForward> = FuturesUnordered::new();

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        if let Err(e) = process_bytes(
                            &buf[..n], &mut framer, &mut transport, &mut conn,
                            &registry, &metrics, &northbound, id, &out_tx, &cmd_tx,
                        ).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e.into()),
                }
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    ConnectionCommand::SendCommand { payload, reply } => {
                        let msg_id = transport.fresh_msg_id();
                        let endpoint = conn.endpoint().unwrap_or([0; 5]);
                        let wire = codec::encode_data_packet(&endpoint, msg_id, &payload);
                        match transport.begin_send(wire, AckKind::DataAck, send_opts).await {
                            Ok(ack_rx) => pending_acks.push(Box::pin(forward_ack(ack_rx, reply))),
                            Err(e) => {
                                metrics.inc_ack_timeouts();
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                }
            }
            Some(outcome) = pending_acks.next(), if !pending_acks.is_empty() => {
                if outcome.is_err() {
                    metrics.inc_ack_timeouts();
                }
            }
            _ = sweep_tick.tick() => {
                for wire in transport.sweep_expired(Instant::now()) {
                    let _ = out_tx.send(wire).await;
                }
            }
            _ = heartbeat_tick.tick() => {
                if let Some(Action::Close(reason)) = conn.tick(liveness_timeout) {
                    break Err(close_reason_to_error(reason));
                }
            }
        }
    };

    transport.fail_all_pending();
    if let Some(endpoint) = conn.endpoint() {
        northbound.publish(NorthboundEvent::BridgeOffline { endpoint }).await;
    }
    writer_task.abort();
    result
}

type AckForward = Pin<Box<dyn Future<Output = Result<SendOutcome, Error>> + Send>>;

/// Waits for a reliable send's ack to resolve (by a matching inbound packet
/// or by the retry sweeper's timeout) and relays the outcome to the
/// dispatcher that asked for it.
async fn forward_ack(
    ack_rx: oneshot::Receiver<Result<SendOutcome, Error>>,
    reply: oneshot::Sender<Result<SendOutcome, Error>>,
) -> Result<SendOutcome, Error> {
    let outcome = ack_rx.await.unwrap_or_else(|_| Err(Kind::ConnectionLost.err()));
    let _ = reply.send(outcome.clone());
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn process_bytes(
    bytes: &[u8],
    framer: &mut Framer,
    transport: &mut Transport,
    conn: &mut Connection,
    registry: &SharedRegistry,
    metrics: &Arc<Metrics>,
    northbound: &Arc<dyn NorthboundPort>,
    id: u64,
    out_tx: &mpsc::Sender<Vec<u8>>,
    cmd_tx: &mpsc::Sender<ConnectionCommand>,
) -> Result<(), Error> {
    let packets = match framer.feed(bytes) {
        Ok(p) => p,
        Err(kind) => {
            metrics.inc_decode_failures();
            return Err(kind.err());
        }
    };

    for wire in packets {
        let decoded = match codec::decode(&wire) {
            Ok(p) => p,
            Err(e) => {
                match e.kind {
                    Kind::InvalidChecksum => metrics.inc_checksum_failures(),
                    Kind::UnknownType(_) => metrics.inc_unknown_packets(),
                    _ => metrics.inc_decode_failures(),
                }
                return Err(e.kind.err());
            }
        };

        let routed = transport.on_packet(decoded, &wire);
        let packet = match routed {
            transport::RoutedEvent::Consumed => continue,
            transport::RoutedEvent::Deliver(p) => p,
        };

        for action in conn.on_packet(packet)? {
            match action {
                Action::Send(bytes) => {
                    let _ = out_tx.send(bytes).await;
                }
                Action::Admit { endpoint } => {
                    registry.register(id, endpoint, cmd_tx.clone());
                    northbound.publish(NorthboundEvent::BridgeOnline { endpoint }).await;
                }
                Action::MeshMembership { mesh_coordinator_id, .. } => {
                    registry.observe_mesh_membership(id, mesh_coordinator_id);
                }
                Action::DeliverStatus { endpoint, msg_id, payload, .. } => {
                    northbound.publish(NorthboundEvent::StateUpdate { endpoint, msg_id, payload }).await;
                }
                Action::DeliverData { endpoint, msg_id, payload } => {
                    // An inbound 0x73 is either the status prefix of a
                    // compound command reply or an unsolicited mesh-wide
                    // event; either way it carries fresh device state that
                    // belongs north of the core.
                    northbound.publish(NorthboundEvent::StateUpdate { endpoint, msg_id, payload }).await;
                }
                Action::Close(reason) => return Err(close_reason_to_error(reason)),
            }
        }
    }

    Ok(())
}

fn close_reason_to_error(reason: CloseReason) -> Error {
    match reason {
        CloseReason::HandshakeTimeout => Kind::ProtocolViolation.err(),
        CloseReason::HeartbeatTimeout => Kind::ConnectionLost.err(),
        CloseReason::ProtocolViolation => Kind::ProtocolViolation.err(),
        CloseReason::PeerClosed => Kind::ConnectionLost.err(),
    }
}
