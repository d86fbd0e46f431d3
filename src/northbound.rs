//! The abstract boundary between this gateway and whatever system actually
//! wants device state and issues commands (a home-automation hub, a test
//! harness, ...). Grounded on the teacher's `event::EndpointPublisher`
//! trait-at-the-seam pattern: the core never depends on a concrete
//! publisher, only on the trait, so swapping what's downstream never
//! touches connection/registry/dispatcher code.

use crate::codec::Endpoint;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NorthboundEvent {
    BridgeOnline { endpoint: Endpoint },
    BridgeOffline { endpoint: Endpoint },
    StateUpdate { endpoint: Endpoint, msg_id: u16, payload: Vec<u8> },
}

#[async_trait]
pub trait NorthboundPort: Send + Sync {
    async fn publish(&self, event: NorthboundEvent);
}

/// Discards everything; useful for the binary's default config and for
/// tests that don't care about northbound delivery.
pub struct NullAdapter;

#[async_trait]
impl NorthboundPort for NullAdapter {
    async fn publish(&self, _event: NorthboundEvent) {}
}

/// Forwards every event onto an `mpsc` channel; the channel's receiving end
/// is handed to whatever real integration wants to consume it, without that
/// integration needing to depend on anything in this crate beyond the event
/// type.
pub struct ChannelAdapter {
    tx: mpsc::Sender<NorthboundEvent>,
}

impl ChannelAdapter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NorthboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NorthboundPort for ChannelAdapter {
    async fn publish(&self, event: NorthboundEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("northbound channel adapter has no receiver left");
        }
    }
}
