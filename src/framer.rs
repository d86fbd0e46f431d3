//! Stateful, per-connection byte-stream deframer.
//!
//! Turns arbitrary TCP chunks into complete packet slices. Grounded on the
//! same "accumulate into one growable buffer, drain complete frames" shape
//! used throughout `s2n-quic-dc`'s receive-side buffering (e.g.
//! `stream/recv/buffer/local.rs`), simplified to this protocol's single
//! 5-byte length-prefixed header instead of a varint frame format.

use crate::codec::HEADER_LEN;
use crate::error::Kind;

/// Single-byte resync attempts bound the cost of scanning garbage; beyond
/// this we give up and declare the stream corrupt rather than scan O(n^2).
const MAX_RESYNC_ATTEMPTS: usize = 64;

pub struct Framer {
    buf: Vec<u8>,
    max_packet_size: usize,
}

impl Framer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(512),
            max_packet_size,
        }
    }

    /// Append freshly-read bytes and return every complete packet now
    /// available, in order. The remainder (a partial packet, if any) stays
    /// buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, Kind> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }

            let data_length = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
            let total_len = HEADER_LEN + data_length;

            if total_len > self.max_packet_size {
                return Err(Kind::Oversize);
            }

            if self.buf.len() < total_len {
                break;
            }

            out.push(self.buf[..total_len].to_vec());
            self.buf.drain(..total_len);
        }

        Ok(out)
    }

    /// Attempt to recover a framing position after an `oversize` (or
    /// otherwise implausible) header by dropping leading bytes one at a time,
    /// bounded by [`MAX_RESYNC_ATTEMPTS`] so a long run of garbage can't force
    /// O(n^2) scanning. Callers that get `oversize`/`corrupt_header` back
    /// from `feed` and want to keep reading (rather than closing the
    /// connection, which is the default policy) can call this before
    /// retrying `feed`.
    pub fn resync(&mut self) -> Result<(), Kind> {
        for _ in 0..MAX_RESYNC_ATTEMPTS {
            if self.buf.is_empty() {
                return Ok(());
            }
            self.buf.remove(0);
            if self.buf.len() < HEADER_LEN {
                return Ok(());
            }
            let data_length = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
            if HEADER_LEN + data_length <= self.max_packet_size {
                return Ok(());
            }
        }
        Err(Kind::CorruptHeader)
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_handshake, encode_heartbeat};

    #[test]
    fn yields_whole_stream_packets_when_fed_in_one_chunk() {
        let mut framer = Framer::new(4096);
        let mut stream = encode_heartbeat();
        stream.extend(encode_handshake(&[1, 2, 3, 4, 5], &[9]));

        let packets = framer.feed(&stream).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], encode_heartbeat());
        assert_eq!(packets[1], encode_handshake(&[1, 2, 3, 4, 5], &[9]));
    }

    #[test]
    fn arbitrary_chunking_yields_same_sequence_as_whole_stream() {
        let mut whole = encode_heartbeat();
        whole.extend(encode_handshake(&[1, 2, 3, 4, 5], &[9, 9, 9]));
        whole.extend(encode_heartbeat());

        let mut baseline = Framer::new(4096);
        let expected = baseline.feed(&whole).unwrap();

        for chunk_size in [1usize, 2, 3, 7, 13] {
            let mut framer = Framer::new(4096);
            let mut got = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                got.extend(framer.feed(chunk).unwrap());
            }
            assert_eq!(got, expected, "mismatch at chunk_size={chunk_size}");
        }
    }

    #[test]
    fn rejects_oversize_declared_length() {
        let mut framer = Framer::new(16);
        let stream = encode_handshake(&[1, 2, 3, 4, 5], &[0u8; 20]);
        assert!(matches!(framer.feed(&stream), Err(Kind::Oversize)));
    }

    #[test]
    fn boundary_length_accepted_and_rejected() {
        let max = 32usize;
        let ok_len = max - HEADER_LEN;
        let mut framer = Framer::new(max);
        let stream = encode_handshake(&[1, 2, 3, 4, 5], &vec![0u8; ok_len - 5]);
        assert_eq!(stream.len(), max);
        assert!(framer.feed(&stream).is_ok());

        let mut framer2 = Framer::new(max);
        let too_big = encode_handshake(&[1, 2, 3, 4, 5], &vec![0u8; ok_len - 5 + 1]);
        assert_eq!(too_big.len(), max + 1);
        assert!(matches!(framer2.feed(&too_big), Err(Kind::Oversize)));
    }

    #[test]
    fn partial_packet_is_buffered_until_complete() {
        let mut framer = Framer::new(4096);
        let stream = encode_handshake(&[1, 2, 3, 4, 5], &[9, 9, 9]);
        let (head, tail) = stream.split_at(3);
        assert!(framer.feed(head).unwrap().is_empty());
        assert_eq!(framer.buffered_len(), 3);
        let packets = framer.feed(tail).unwrap();
        assert_eq!(packets, vec![stream]);
    }
}
