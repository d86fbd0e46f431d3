//! Command Dispatcher: turns a northbound device command into a `0x73` DATA
//! CHANNEL packet and fans it out to the primary bridge plus a configurable
//! number of redundant bridges in the same mesh.
//!
//! Grounded on the teacher's `stream::send` retry-and-race shape (send to
//! every candidate path, resolve on the first success) generalized from
//! "one path with failover" to "N bridges, first compound response wins".

use crate::error::{Error, Kind};
use crate::registry::{ConnectionCommand, SharedRegistry};
use crate::roster::DeviceRoster;
use crate::transport::SendOutcome;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const DEFAULT_COMMAND_TARGETS: usize = 2;

/// 2-byte LE device id followed by a 3-byte action code and optional
/// parameters - the payload carried inside a `0x73` DATA CHANNEL packet.
pub const ACTION_POWER_TOGGLE: [u8; 3] = [0xf8, 0xd0, 0x0d];
pub const ACTION_SET_MODE: [u8; 3] = [0xf8, 0x8e, 0x0c];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    PowerToggle { on: bool },
    SetMode { mode: u8 },
}

impl Command {
    fn encode_payload(self, device_id: u16) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&device_id.to_le_bytes());
        match self {
            Command::PowerToggle { on } => {
                payload.extend_from_slice(&ACTION_POWER_TOGGLE);
                payload.push(on as u8);
            }
            Command::SetMode { mode } => {
                payload.extend_from_slice(&ACTION_SET_MODE);
                payload.push(mode);
            }
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub delivered_by: Option<u64>,
    pub outcome: SendOutcome,
}

pub struct Dispatcher {
    registry: SharedRegistry,
    roster: Arc<DeviceRoster>,
    command_targets: usize,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry, roster: Arc<DeviceRoster>) -> Self {
        Self {
            registry,
            roster,
            command_targets: DEFAULT_COMMAND_TARGETS,
        }
    }

    pub fn with_command_targets(mut self, command_targets: usize) -> Self {
        self.command_targets = command_targets.max(1);
        self
    }

    /// Resolve `device_id` to its mesh, pick the primary bridge plus up to
    /// `command_targets - 1` redundant ones, and race their reliable-send
    /// replies against all of them. The first non-pure-ack response wins; if
    /// every target comes back with a pure ack or times out, the command is
    /// reported as undelivered rather than silently successful.
    pub async fn dispatch(&self, device_id: u16, command: Command) -> Result<DispatchResult, Error> {
        let mesh_id = self.roster.mesh_id_for(device_id)?;
        let mut targets = self.registry.bridges_in_mesh(mesh_id);
        if targets.is_empty() {
            return Err(Kind::NoBridgeInMesh.err());
        }
        targets.sort_by_key(|b| b.admitted_at);
        targets.truncate(self.command_targets);

        let payload = command.encode_payload(device_id);

        // Fire the send to every chosen bridge in parallel and race their
        // replies - whichever answers with a compound response first wins,
        // rather than waiting on targets in admission order.
        let mut pending = FuturesUnordered::new();
        for target in &targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = ConnectionCommand::SendCommand { payload: payload.clone(), reply: reply_tx };
            if target.cmd_tx.send(cmd).await.is_err() {
                warn!(bridge = target.id, "bridge connection task gone before dispatch");
                continue;
            }
            let bridge_id = target.id;
            pending.push(async move { (bridge_id, reply_rx.await) });
        }

        if pending.is_empty() {
            return Err(Kind::NoBridgeDelivered.err());
        }

        let mut saw_pure_ack = false;
        while let Some((bridge_id, result)) = pending.next().await {
            match result {
                Ok(Ok(SendOutcome::Acked)) => {
                    debug!(bridge_id, device_id, "command delivered");
                    return Ok(DispatchResult { delivered_by: Some(bridge_id), outcome: SendOutcome::Acked });
                }
                Ok(Ok(SendOutcome::PureAck)) => saw_pure_ack = true,
                Ok(Err(_)) | Err(_) => {}
            }
        }

        if saw_pure_ack {
            Ok(DispatchResult { delivered_by: None, outcome: SendOutcome::PureAck })
        } else {
            Err(Kind::NoBridgeDelivered.err())
        }
    }
}
