// Crate-wide error type.
//
// Grounded on s2n-quic-dc's `stream/send/error.rs`: a `Kind` enum carrying the
// `thiserror` message for each case, wrapped by an `Error` that is what actually
// propagates. This crate drops the teacher's `#[track_caller]` file/line capture -
// that bookkeeping exists there to annotate retransmission bugs across a much
// larger state machine, which a ten-packet-type protocol doesn't need.

use std::fmt;

#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
}

impl Error {
    pub fn new(kind: Kind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {}

impl From<Kind> for Error {
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Kind {
    #[error("packet too short to contain a header")]
    TooShort,
    #[error("unknown packet type byte {0:#04x}")]
    UnknownType(u8),
    #[error("declared data_length does not match the packet's actual length")]
    LengthMismatch,
    #[error("framed packet failed its checksum")]
    InvalidChecksum,
    #[error("framed packet is missing or misplaces its 0x7e markers")]
    MalformedFrame,
    #[error("stream buffered a packet declaring a length beyond the configured ceiling")]
    Oversize,
    #[error("stream could not resynchronize on a packet boundary")]
    CorruptHeader,
    #[error("send exhausted its retry budget without a matching ack")]
    AckTimeout,
    #[error("the connection closed while a send was outstanding")]
    ConnectionLost,
    #[error("every targeted bridge returned a pure ack or timed out")]
    NoBridgeDelivered,
    #[error("peer address rejected by the tcp whitelist")]
    AdmissionRefusedWhitelist,
    #[error("admission cap reached ({0} concurrent bridges)")]
    AdmissionRefusedCap(usize),
    #[error("packet violated the connection's current protocol state")]
    ProtocolViolation,
    #[error("configuration could not be resolved: {0}")]
    Config(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("the device addressed by this command is not present in the roster")]
    UnknownDevice,
    #[error("the mesh for this device has no admitted bridge")]
    NoBridgeInMesh,
}

impl Kind {
    pub fn err(self) -> Error {
        Error::new(self)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Kind::Io(e.to_string()).err()
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Kind::Config(e.to_string()).err()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode-path errors carry a short hex preview of the offending bytes so logs are
/// actionable without dumping the whole packet.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {preview}")]
pub struct PacketDecodeError {
    pub kind: Kind,
    pub preview: String,
}

impl PacketDecodeError {
    pub fn new(kind: Kind, bytes: &[u8]) -> Self {
        let n = bytes.len().min(16);
        Self {
            kind,
            preview: hex::encode(&bytes[..n]),
        }
    }
}
