//! A single outstanding reliable send and what resolves it.

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use super::SendOutcome;
use crate::error::Error;

/// Which inbound packet type completes a pending send, and how to correlate
/// it. `0x7b` (DATA_ACK) carries the msg_id it's acking, so those sends are
/// looked up in a map. The other three ack types (`0x28`, `0x88`, `0xd8`)
/// carry no msg_id at all, so sends awaiting them are matched strictly in
/// send order against a per-type FIFO queue - the peer is expected to answer
/// each one before the next is sent, which the Connection state machine
/// enforces by only allowing one outstanding send per type on a given
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    DataAck,
    HelloAck,
    InfoAck,
    StatusAck,
}

impl AckKind {
    pub fn type_byte(self) -> u8 {
        match self {
            AckKind::DataAck => crate::codec::TYPE_DATA_ACK,
            AckKind::HelloAck => crate::codec::TYPE_HELLO_ACK,
            AckKind::InfoAck => crate::codec::TYPE_INFO_ACK,
            AckKind::StatusAck => crate::codec::TYPE_STATUS_ACK,
        }
    }

    /// Only `DataAck` carries a msg_id; the others are matched FIFO.
    pub fn is_keyed(self) -> bool {
        matches!(self, AckKind::DataAck)
    }
}

/// One in-flight reliable send. Resolved either by a matching ack arriving
/// (`Transport::on_packet`) or by the retry sweeper deciding its deadline has
/// passed (`Transport::sweep`) - never both, and never left unresolved.
pub struct PendingSend {
    pub wire: Vec<u8>,
    pub ack: AckKind,
    pub attempts_remaining: u32,
    pub ack_timeout: Duration,
    pub deadline: Instant,
    pub completion: Option<oneshot::Sender<Result<SendOutcome, Error>>>,
}

impl PendingSend {
    pub fn new(
        wire: Vec<u8>,
        ack: AckKind,
        attempts_remaining: u32,
        ack_timeout: Duration,
        completion: oneshot::Sender<Result<SendOutcome, Error>>,
    ) -> Self {
        Self {
            wire,
            ack,
            attempts_remaining,
            ack_timeout,
            deadline: Instant::now() + ack_timeout,
            completion: Some(completion),
        }
    }

    pub fn complete(&mut self, outcome: Result<SendOutcome, Error>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }
}
