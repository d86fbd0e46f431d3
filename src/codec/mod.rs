//! Pure encode/decode for the Cync bridge wire protocol.
//!
//! No I/O and no connection state lives here - this module only turns bytes
//! into [`Packet`]s and back, mirroring the split between `s2n-codec`'s buffer
//! primitives and `s2n-quic-dc`'s `packet::stream` module in the teacher, just
//! specialized to this protocol's ten fixed packet types instead of a generic
//! varint-tagged frame format.

use crate::error::{Kind, PacketDecodeError};

/// Header is always `type, 0x00, 0x00, len_hi, len_lo`.
pub const HEADER_LEN: usize = 5;
pub const FRAME_MARKER: u8 = 0x7E;

pub const TYPE_HANDSHAKE: u8 = 0x23;
pub const TYPE_HELLO_ACK: u8 = 0x28;
pub const TYPE_DEVICE_INFO: u8 = 0x43;
pub const TYPE_INFO_ACK: u8 = 0x48;
pub const TYPE_DATA_CHANNEL: u8 = 0x73;
pub const TYPE_DATA_ACK: u8 = 0x7B;
pub const TYPE_STATUS_BROADCAST: u8 = 0x83;
pub const TYPE_STATUS_ACK: u8 = 0x88;
pub const TYPE_HEARTBEAT: u8 = 0xD3;
pub const TYPE_HEARTBEAT_ACK: u8 = 0xD8;

pub type Endpoint = [u8; 5];

/// A decoded packet. The payload for framed types is the region strictly
/// between the `0x7e` markers (after the 6 skipped bytes, before the checksum
/// byte); callers that need the raw wire bytes should keep the slice they
/// decoded from rather than re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake {
        endpoint: Endpoint,
        auth_code: Vec<u8>,
    },
    HelloAck,
    DeviceInfo {
        endpoint: Endpoint,
        payload: Vec<u8>,
    },
    InfoAck,
    DataChannel {
        endpoint: Endpoint,
        msg_id: u16,
        payload: Vec<u8>,
    },
    DataAck {
        endpoint: Endpoint,
        msg_id: u16,
        payload: Vec<u8>,
    },
    StatusBroadcast {
        endpoint: Endpoint,
        msg_id: u16,
        payload: Vec<u8>,
    },
    StatusAck,
    Heartbeat,
    HeartbeatAck,
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        match self {
            Packet::Handshake { .. } => TYPE_HANDSHAKE,
            Packet::HelloAck => TYPE_HELLO_ACK,
            Packet::DeviceInfo { .. } => TYPE_DEVICE_INFO,
            Packet::InfoAck => TYPE_INFO_ACK,
            Packet::DataChannel { .. } => TYPE_DATA_CHANNEL,
            Packet::DataAck { .. } => TYPE_DATA_ACK,
            Packet::StatusBroadcast { .. } => TYPE_STATUS_BROADCAST,
            Packet::StatusAck => TYPE_STATUS_ACK,
            Packet::Heartbeat => TYPE_HEARTBEAT,
            Packet::HeartbeatAck => TYPE_HEARTBEAT_ACK,
        }
    }

    /// Framed packets (0x73, 0x83) carry 0x7e markers and a mod-256 checksum.
    pub fn is_framed(type_byte: u8) -> bool {
        matches!(type_byte, TYPE_DATA_CHANNEL | TYPE_STATUS_BROADCAST)
    }
}

/// Locate the first and last `0x7e` in `bytes`, searching from `start` onward
/// so an endpoint or msg_id byte that happens to equal `0x7e` can't mis-anchor
/// the frame (the header, endpoint, and msg_id together are the first 12
/// bytes of every framed type, so the scan must start past all three).
fn find_markers(bytes: &[u8], start: usize) -> Option<(usize, usize)> {
    let first = bytes[start..].iter().position(|&b| b == FRAME_MARKER)? + start;
    let last = bytes.iter().rposition(|&b| b == FRAME_MARKER)?;
    if last <= first {
        return None;
    }
    Some((first, last))
}

/// `sum(bytes[first+6 .. last-1]) mod 256` - the region strictly inside the
/// 6 skipped bytes after the opening marker and before the checksum byte that
/// precedes the closing marker.
pub fn checksum(bytes: &[u8]) -> Result<u8, Kind> {
    let (first, last) = find_markers(bytes, 12).ok_or(Kind::MalformedFrame)?;
    let payload_start = first + 7;
    let payload_end = last.checked_sub(1).ok_or(Kind::MalformedFrame)?;
    if payload_start > payload_end || payload_end > bytes.len() {
        return Err(Kind::MalformedFrame);
    }
    let sum = bytes[payload_start..payload_end]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    Ok(sum)
}

/// 5-byte endpoint at offset 5, present in every packet type.
pub fn extract_endpoint(bytes: &[u8]) -> Option<Endpoint> {
    if bytes.len() < 10 {
        return None;
    }
    let mut ep = [0u8; 5];
    ep.copy_from_slice(&bytes[5..10]);
    Some(ep)
}

/// bytes[10:12], big-endian. Only meaningful for 0x73/0x83/0x7b.
pub fn extract_msg_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 12 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[10], bytes[11]]))
}

fn header_data_length(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([bytes[3], bytes[4]]) as usize)
}

/// Decode a single complete packet. The Framer is responsible for handing us
/// exactly one packet's worth of bytes; this function re-validates the length
/// anyway since it is also used directly by tests and property checks.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketDecodeError> {
    let type_byte = *bytes.first().ok_or(Kind::TooShort).map_err(|k| wrap(k, bytes))?;
    let data_length = header_data_length(bytes).ok_or(Kind::TooShort).map_err(|k| wrap(k, bytes))?;
    if bytes.len() != HEADER_LEN + data_length {
        return Err(wrap(Kind::LengthMismatch, bytes));
    }

    match type_byte {
        TYPE_HANDSHAKE => {
            let endpoint = extract_endpoint(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
            let auth_code = bytes.get(10..).unwrap_or(&[]).to_vec();
            Ok(Packet::Handshake { endpoint, auth_code })
        }
        TYPE_HELLO_ACK => Ok(Packet::HelloAck),
        TYPE_DEVICE_INFO => {
            let endpoint = extract_endpoint(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
            let payload = bytes.get(10..).unwrap_or(&[]).to_vec();
            Ok(Packet::DeviceInfo { endpoint, payload })
        }
        TYPE_INFO_ACK => Ok(Packet::InfoAck),
        TYPE_DATA_CHANNEL => decode_framed(bytes, true).map(|(endpoint, msg_id, payload)| {
            Packet::DataChannel { endpoint, msg_id, payload }
        }),
        TYPE_DATA_ACK => {
            let endpoint = extract_endpoint(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
            let msg_id = extract_msg_id(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
            let payload = bytes.get(12..).unwrap_or(&[]).to_vec();
            Ok(Packet::DataAck { endpoint, msg_id, payload })
        }
        TYPE_STATUS_BROADCAST => decode_framed(bytes, false).map(|(endpoint, msg_id, payload)| {
            Packet::StatusBroadcast { endpoint, msg_id, payload }
        }),
        TYPE_STATUS_ACK => Ok(Packet::StatusAck),
        TYPE_HEARTBEAT => Ok(Packet::Heartbeat),
        TYPE_HEARTBEAT_ACK => Ok(Packet::HeartbeatAck),
        other => Err(wrap(Kind::UnknownType(other), bytes)),
    }
}

fn wrap(kind: Kind, bytes: &[u8]) -> PacketDecodeError {
    PacketDecodeError::new(kind, bytes)
}

/// Shared decode path for 0x73/0x83: endpoint, msg_id, an optional padding
/// byte (0x73 only), then the 0x7e-delimited, checksummed payload.
fn decode_framed(bytes: &[u8], has_padding_byte: bool) -> Result<(Endpoint, u16, Vec<u8>), PacketDecodeError> {
    let endpoint = extract_endpoint(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
    let msg_id = extract_msg_id(bytes).ok_or_else(|| wrap(Kind::TooShort, bytes))?;
    let _ = has_padding_byte;

    let sum = checksum(bytes).map_err(|k| wrap(k, bytes))?;
    let (first, last) = find_markers(bytes, 12).ok_or_else(|| wrap(Kind::MalformedFrame, bytes))?;
    let checksum_byte = *bytes.get(last - 1).ok_or_else(|| wrap(Kind::MalformedFrame, bytes))?;
    if checksum_byte != sum {
        return Err(wrap(Kind::InvalidChecksum, bytes));
    }

    let payload_start = first + 7;
    let payload_end = last - 1;
    let payload = bytes[payload_start..payload_end].to_vec();
    Ok((endpoint, msg_id, payload))
}

fn encode_header(type_byte: u8, data_length: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data_length as usize);
    out.push(type_byte);
    out.push(0x00);
    out.push(0x00);
    out.extend_from_slice(&data_length.to_be_bytes());
    out
}

pub fn encode_handshake(endpoint: &Endpoint, auth_code: &[u8]) -> Vec<u8> {
    let data_len = 5 + auth_code.len();
    let mut out = encode_header(TYPE_HANDSHAKE, data_len as u16);
    out.extend_from_slice(endpoint);
    out.extend_from_slice(auth_code);
    out
}

pub fn encode_hello_ack() -> Vec<u8> {
    encode_header(TYPE_HELLO_ACK, 2)
        .into_iter()
        .chain([0x00, 0x00])
        .collect()
}

pub fn encode_info_ack() -> Vec<u8> {
    encode_header(TYPE_INFO_ACK, 0)
}

/// Shared encode path for 0x73/0x83.
fn encode_framed(type_byte: u8, endpoint: &Endpoint, msg_id: u16, payload: &[u8], padding_byte: bool) -> Vec<u8> {
    let mut framed_body = Vec::new();
    framed_body.extend_from_slice(endpoint);
    framed_body.extend_from_slice(&msg_id.to_be_bytes());
    if padding_byte {
        framed_body.push(0x00);
    }
    framed_body.push(FRAME_MARKER);
    framed_body.extend_from_slice(&[0u8; 6]);
    framed_body.extend_from_slice(payload);
    let sum = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    framed_body.push(sum);
    framed_body.push(FRAME_MARKER);

    let mut out = encode_header(type_byte, framed_body.len() as u16);
    out.extend_from_slice(&framed_body);
    out
}

pub fn encode_data_packet(endpoint: &Endpoint, msg_id: u16, payload: &[u8]) -> Vec<u8> {
    encode_framed(TYPE_DATA_CHANNEL, endpoint, msg_id, payload, true)
}

pub fn encode_status_broadcast(endpoint: &Endpoint, msg_id: u16, payload: &[u8]) -> Vec<u8> {
    encode_framed(TYPE_STATUS_BROADCAST, endpoint, msg_id, payload, false)
}

pub fn encode_data_ack(endpoint: &Endpoint, msg_id: u16, payload: &[u8]) -> Vec<u8> {
    let data_len = 7 + payload.len();
    let mut out = encode_header(TYPE_DATA_ACK, data_len as u16);
    out.extend_from_slice(endpoint);
    out.extend_from_slice(&msg_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_status_ack() -> Vec<u8> {
    encode_header(TYPE_STATUS_ACK, 0)
}

pub fn encode_heartbeat() -> Vec<u8> {
    encode_header(TYPE_HEARTBEAT, 0)
}

pub fn encode_heartbeat_ack() -> Vec<u8> {
    encode_header(TYPE_HEARTBEAT_ACK, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> Endpoint {
        [0x45, 0x88, 0x0f, 0x3a, 0x00]
    }

    #[test]
    fn round_trips_handshake() {
        let wire = encode_handshake(&sample_endpoint(), &[0x01, 0x02]);
        let decoded = decode(&wire).unwrap();
        assert_eq!(
            decoded,
            Packet::Handshake {
                endpoint: sample_endpoint(),
                auth_code: vec![0x01, 0x02],
            }
        );
    }

    #[test]
    fn round_trips_data_channel_and_verifies_checksum() {
        let payload = b"abc123".to_vec();
        let wire = encode_data_packet(&sample_endpoint(), 0x1234, &payload);
        assert!(checksum(&wire).is_ok());
        let decoded = decode(&wire).unwrap();
        assert_eq!(
            decoded,
            Packet::DataChannel {
                endpoint: sample_endpoint(),
                msg_id: 0x1234,
                payload,
            }
        );
    }

    #[test]
    fn round_trips_status_broadcast() {
        let payload = vec![0x0d, 0x01, 0x00, 0x00, 0xf9];
        let wire = encode_status_broadcast(&sample_endpoint(), 0x0056, &payload);
        let decoded = decode(&wire).unwrap();
        assert_eq!(
            decoded,
            Packet::StatusBroadcast {
                endpoint: sample_endpoint(),
                msg_id: 0x0056,
                payload,
            }
        );
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut wire = encode_data_packet(&sample_endpoint(), 1, b"hello");
        let last = wire.len() - 2;
        wire[last] ^= 0xFF;
        assert!(matches!(decode(&wire).unwrap_err().kind, Kind::InvalidChecksum));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut wire = encode_heartbeat();
        wire.push(0xAA);
        assert!(matches!(decode(&wire).unwrap_err().kind, Kind::LengthMismatch));
    }

    #[test]
    fn rejects_unknown_type() {
        let wire = vec![0x99, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(decode(&wire).unwrap_err().kind, Kind::UnknownType(0x99)));
    }

    #[test]
    fn endpoint_byte_equal_to_marker_does_not_misanchor_framing() {
        // An endpoint containing 0x7e must not be mistaken for the opening marker.
        let endpoint: Endpoint = [0x7e, 0x00, 0x00, 0x00, 0x00];
        let wire = encode_data_packet(&endpoint, 7, b"payload");
        let decoded = decode(&wire).unwrap();
        match decoded {
            Packet::DataChannel { endpoint: e, payload, .. } => {
                assert_eq!(e, endpoint);
                assert_eq!(payload, b"payload");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn msg_id_byte_equal_to_marker_does_not_misanchor_framing() {
        // msg_id occupies bytes 10-11, right where a scan starting too early
        // would find a false opening marker.
        let msg_id = 0x7E01;
        let wire = encode_data_packet(&sample_endpoint(), msg_id, b"payload");
        let decoded = decode(&wire).unwrap();
        match decoded {
            Packet::DataChannel { msg_id: m, payload, .. } => {
                assert_eq!(m, msg_id);
                assert_eq!(payload, b"payload");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_never_panics_on_random_bytes() {
        // Deterministic pseudo-random-ish coverage without pulling in a fuzz harness.
        let mut seed: u32 = 0x9E3779B9;
        for _ in 0..2000 {
            let mut buf = Vec::new();
            for _ in 0..(seed % 40) {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                buf.push((seed >> 16) as u8);
            }
            let _ = decode(&buf);
        }
    }

    #[test]
    fn all_ten_types_round_trip() {
        let ep = sample_endpoint();
        let samples = vec![
            encode_handshake(&ep, &[1, 2, 3]),
            encode_hello_ack(),
            {
                let mut v = encode_header(TYPE_DEVICE_INFO, 5);
                v.extend_from_slice(&ep);
                v
            },
            encode_info_ack(),
            encode_data_packet(&ep, 1, b"x"),
            encode_data_ack(&ep, 1, &[]),
            encode_status_broadcast(&ep, 2, b"y"),
            encode_status_ack(),
            encode_heartbeat(),
            encode_heartbeat_ack(),
        ];
        for wire in samples {
            let decoded = decode(&wire).expect("should decode");
            assert_eq!(decoded.type_byte(), wire[0]);
        }
    }
}
