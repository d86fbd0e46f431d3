//! End-to-end scenarios driven directly against the protocol layers
//! (codec -> framer -> connection -> transport) without a real socket,
//! mirroring how the teacher's integration tests drive a `Driver` end to
//! end without standing up a network.

use cync_gateway::codec::{self, Packet};
use cync_gateway::connection::{Action, Connection, OFFLINE_DEBOUNCE_THRESHOLD};
use cync_gateway::framer::Framer;
use cync_gateway::transport::{AckKind, RoutedEvent, SendOpts, Transport};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)
}

#[test]
fn handshake_sequence_produces_expected_wire_replies() {
    let mut conn = Connection::new(addr());
    let endpoint = [1, 2, 3, 4, 5];

    let actions = conn
        .on_packet(Packet::Handshake { endpoint, auth_code: vec![0xAA] })
        .unwrap();
    assert!(actions.contains(&Action::Send(codec::encode_hello_ack())));

    let actions = conn
        .on_packet(Packet::DeviceInfo { endpoint, payload: vec![0x01] })
        .unwrap();
    assert_eq!(actions, vec![Action::Send(codec::encode_info_ack())]);
}

#[tokio::test]
async fn toggle_on_produces_a_compound_status_and_ack_response() {
    let (tx, mut rx) = mpsc::channel(8);
    let mut transport = Transport::new(tx, 1);
    let endpoint = [7, 7, 7, 7, 7];
    let msg_id = transport.fresh_msg_id();
    let wire = codec::encode_data_packet(&endpoint, msg_id, b"power-on");

    // begin_send registers the pending ack and transmits once, without
    // holding `&mut transport` across the wait - so on_packet can run on the
    // same transport before the ack receiver is awaited.
    let ack_rx = transport.begin_send(wire, AckKind::DataAck, SendOpts::default()).await.unwrap();
    assert!(rx.recv().await.is_some());

    // The bridge answers with a 0x73 status prefix (new device state)
    // followed by the data ack for the same endpoint, arriving as two
    // packets from one read the way a real compound reply would.
    let status_wire = codec::encode_data_packet(&endpoint, 42, b"on");
    let status = codec::decode(&status_wire).unwrap();
    assert!(matches!(transport.on_packet(status, &status_wire), RoutedEvent::Deliver(_)));

    let ack_wire = codec::encode_data_ack(&endpoint, msg_id, &[]);
    let ack = codec::decode(&ack_wire).unwrap();
    transport.on_packet(ack, &ack_wire);

    let outcome = ack_rx.await.unwrap().unwrap();
    assert_eq!(outcome, cync_gateway::transport::SendOutcome::Acked);
}

#[test]
fn invalid_device_command_gets_a_pure_ack_not_a_transport_error() {
    // A bare ack (no preceding status broadcast, empty payload) for an
    // unrecognized device is still a valid reply - not every command
    // changes observable state.
    let endpoint = [8, 8, 8, 8, 8];
    let ack_wire = codec::encode_data_ack(&endpoint, 5, &[]);
    let decoded = codec::decode(&ack_wire).unwrap();
    match decoded {
        Packet::DataAck { payload, .. } => assert!(payload.is_empty()),
        _ => panic!("wrong variant"),
    }
}

#[test]
fn heartbeat_loss_marks_the_connection_for_closing() {
    let mut conn = Connection::new(addr());
    let endpoint = [3, 3, 3, 3, 3];
    conn.on_packet(Packet::Handshake { endpoint, auth_code: vec![] }).unwrap();
    conn.on_packet(Packet::DeviceInfo { endpoint, payload: vec![] }).unwrap();

    let action = conn.tick(Duration::from_millis(0));
    assert!(matches!(action, Some(Action::Close(_))));
}

#[test]
fn thirteen_bridges_in_one_mesh_deduplicate_the_same_broadcast() {
    // Unsolicited 0x73 traffic carries the shared mesh-coordinator id, not a
    // per-bridge endpoint - thirteen bridges relaying the same mesh event
    // all report the same endpoint with distinct msg_ids.
    let mut transport = Transport::new(mpsc::channel(256).0, 1);
    let mesh_coordinator = [0x11, 0x22, 0x33, 0x44, 0x55];
    let payload = b"mesh-wide-status-change".to_vec();

    let mut delivered = 0;
    for msg_id in 0u16..13 {
        let wire = codec::encode_data_packet(&mesh_coordinator, msg_id, &payload);
        let decoded = codec::decode(&wire).unwrap();
        if matches!(transport.on_packet(decoded, &wire), RoutedEvent::Deliver(_)) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1, "only the first bridge's copy of a mesh-wide broadcast should be delivered");
}

#[test]
fn reconnect_reassigns_a_fresh_msg_id_sequence() {
    let (tx, _rx) = mpsc::channel(4);
    let mut first = Transport::new(tx.clone(), 100);
    assert_eq!(first.fresh_msg_id(), 100);
    assert_eq!(first.fresh_msg_id(), 101);

    // A reconnect gets a brand new Transport seeded independently - there's
    // no shared sequence across connections to "supersede".
    let mut second = Transport::new(tx, 7);
    assert_eq!(second.fresh_msg_id(), 7);
}

#[test]
fn framer_and_connection_survive_arbitrary_chunking() {
    let mut framer = Framer::new(4096);
    let endpoint = [4, 4, 4, 4, 4];
    let mut stream = codec::encode_handshake(&endpoint, &[]);
    stream.extend(codec::encode_heartbeat());

    let mut conn = Connection::new(addr());
    let mut seen_close = None;

    for chunk in stream.chunks(3) {
        for wire in framer.feed(chunk).unwrap() {
            let packet = codec::decode(&wire).unwrap();
            match conn.on_packet(packet) {
                Ok(_actions) => {}
                Err(e) => seen_close = Some(e),
            }
        }
    }

    // Heartbeat arrives before DeviceInfo, which is a protocol violation in
    // the Handshaking state - exercising that the framer's chunking doesn't
    // change what the state machine decides.
    assert!(seen_close.is_some());
    let _ = OFFLINE_DEBOUNCE_THRESHOLD;
}
