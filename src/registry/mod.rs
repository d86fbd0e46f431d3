//! Process-wide table of admitted bridge connections and their mesh
//! membership.
//!
//! Grounded on the teacher's choice of `dashmap` for shared, frequently-read
//! connection tables (`s2n-quic-dc` reaches for it wherever a manager-style
//! struct is touched from multiple tasks); the poll-driven worker-pool
//! machinery the teacher wraps around it
//! (`dc/s2n-quic-dc/src/stream/server/tokio/tcp/manager.rs`) doesn't fit
//! here - this registry is an address book, not a scheduler, so it's a flat
//! concurrent map plus a handful of atomics.

use crate::codec::Endpoint;
use crate::error::{Error, Kind};
use crate::transport::SendOutcome;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub type ConnectionId = u64;

/// Sent to a connection task by anything that wants it to issue a reliable
/// command over its socket (the Command Dispatcher, principally). The
/// connection task owns the only `Transport` that can legally send on this
/// connection, so every other component reaches it through this channel
/// instead of touching the socket or the ack tables directly.
pub enum ConnectionCommand {
    SendCommand {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<SendOutcome, Error>>,
    },
}

#[derive(Clone)]
pub struct BridgeHandle {
    pub id: ConnectionId,
    pub endpoint: Endpoint,
    pub mesh_coordinator_id: Option<Endpoint>,
    pub admitted_at: Instant,
    pub cmd_tx: mpsc::Sender<ConnectionCommand>,
}

pub struct RegistryConfig {
    pub max_connections: usize,
    pub ip_whitelist: Option<HashSet<IpAddr>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            ip_whitelist: None,
        }
    }
}

/// Shared across every connection task and the Command Dispatcher.
pub struct Registry {
    config: RwLock<RegistryConfig>,
    bridges: DashMap<ConnectionId, BridgeHandle>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config: RwLock::new(config),
            bridges: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Called right after `accept()`, before any bytes are read. Rejects on
    /// an IP not on the whitelist (when one is configured) or when the
    /// concurrent-connection cap is already saturated.
    pub fn admit(&self, peer_ip: IpAddr) -> Result<ConnectionId, Error> {
        let config = self.config.read();
        if let Some(whitelist) = &config.ip_whitelist {
            if !whitelist.contains(&peer_ip) {
                return Err(Kind::AdmissionRefusedWhitelist.err());
            }
        }
        if self.bridges.len() >= config.max_connections {
            return Err(Kind::AdmissionRefusedCap(config.max_connections).err());
        }
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Called once the connection has completed its handshake and knows its
    /// bridge endpoint. A bridge that reconnects opens a brand new TCP
    /// connection before the old one notices its socket is dead, so the old
    /// `BridgeHandle` for this endpoint - if any - is torn down here rather
    /// than left to coexist with the new one and race it for dispatches.
    pub fn register(&self, id: ConnectionId, endpoint: Endpoint, cmd_tx: mpsc::Sender<ConnectionCommand>) {
        let stale = self
            .bridges
            .iter()
            .find(|e| e.endpoint == endpoint && *e.key() != id)
            .map(|e| *e.key());
        if let Some(stale_id) = stale {
            info!(?endpoint, old = stale_id, new = id, "reconnect supersedes prior bridge record");
            self.bridges.remove(&stale_id);
        }

        let handle = BridgeHandle {
            id,
            endpoint,
            mesh_coordinator_id: None,
            admitted_at: Instant::now(),
            cmd_tx,
        };
        debug!(?endpoint, id, "bridge registered");
        self.bridges.insert(id, handle);
    }

    /// A bridge's status broadcasts reveal which mesh it belongs to via the
    /// coordinator endpoint embedded in the payload; record it so
    /// `bridges_in_mesh`/`primary_for` can answer by mesh id instead of by
    /// connection.
    pub fn observe_mesh_membership(&self, id: ConnectionId, mesh_coordinator_id: Endpoint) {
        if let Some(mut entry) = self.bridges.get_mut(&id) {
            entry.mesh_coordinator_id = Some(mesh_coordinator_id);
        }
    }

    pub fn unregister(&self, id: ConnectionId) {
        if self.bridges.remove(&id).is_some() {
            info!(id, "bridge unregistered");
        }
    }

    pub fn bridges_in_mesh(&self, mesh_coordinator_id: Endpoint) -> Vec<BridgeHandle> {
        self.bridges
            .iter()
            .filter(|e| e.mesh_coordinator_id == Some(mesh_coordinator_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// The longest-admitted live bridge in the mesh is the primary - stable
    /// under reconnects of other bridges, and cheap to recompute on demand
    /// rather than tracked incrementally.
    pub fn primary_for(&self, mesh_coordinator_id: Endpoint) -> Option<BridgeHandle> {
        self.bridges_in_mesh(mesh_coordinator_id)
            .into_iter()
            .min_by_key(|b| b.admitted_at)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn get(&self, id: ConnectionId) -> Option<BridgeHandle> {
        self.bridges.get(&id).map(|e| e.value().clone())
    }
}

pub type SharedRegistry = Arc<Registry>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sender() -> mpsc::Sender<ConnectionCommand> {
        mpsc::channel(1).0
    }

    #[test]
    fn admission_respects_whitelist() {
        let allowed: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let denied: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();
        let registry = Registry::new(RegistryConfig {
            max_connections: 10,
            ip_whitelist: Some(HashSet::from([allowed])),
        });
        assert!(registry.admit(allowed).is_ok());
        assert!(matches!(registry.admit(denied).unwrap_err().kind(), Kind::AdmissionRefusedWhitelist));
    }

    #[test]
    fn admission_respects_connection_cap() {
        let registry = Registry::new(RegistryConfig { max_connections: 1, ip_whitelist: None });
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let id = registry.admit(ip).unwrap();
        registry.register(id, [1, 2, 3, 4, 5], sender());
        assert!(matches!(registry.admit(ip).unwrap_err().kind(), Kind::AdmissionRefusedCap(1)));
    }

    #[test]
    fn primary_is_the_oldest_admitted_bridge_in_the_mesh() {
        let registry = Registry::new(RegistryConfig::default());
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let mesh = [9, 9, 9, 9, 9];

        let first = registry.admit(ip).unwrap();
        registry.register(first, [1, 1, 1, 1, 1], sender());
        registry.observe_mesh_membership(first, mesh);

        std::thread::sleep(std::time::Duration::from_millis(5));

        let second = registry.admit(ip).unwrap();
        registry.register(second, [2, 2, 2, 2, 2], sender());
        registry.observe_mesh_membership(second, mesh);

        let primary = registry.primary_for(mesh).unwrap();
        assert_eq!(primary.id, first);
        assert_eq!(registry.bridges_in_mesh(mesh).len(), 2);
    }

    #[test]
    fn reconnect_supersedes_the_prior_record_for_the_same_endpoint() {
        let registry = Registry::new(RegistryConfig::default());
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let endpoint = [4, 4, 4, 4, 4];

        let first = registry.admit(ip).unwrap();
        registry.register(first, endpoint, sender());
        assert_eq!(registry.len(), 1);

        let second = registry.admit(ip).unwrap();
        registry.register(second, endpoint, sender());

        assert_eq!(registry.len(), 1, "the stale record should be gone, not coexisting");
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
    }

    #[test]
    fn unregister_removes_bridge_and_frees_capacity() {
        let registry = Registry::new(RegistryConfig { max_connections: 1, ip_whitelist: None });
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        let id = registry.admit(ip).unwrap();
        registry.register(id, [1, 2, 3, 4, 5], sender());
        registry.unregister(id);
        assert!(registry.is_empty());
        assert!(registry.admit(ip).is_ok());
    }
}
