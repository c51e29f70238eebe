//! Shared location cache.
//!
//! Holds two tables for the lifetime of the owning client: where each service
//! instance runs (`instance id -> node id`) and one connection slot per peer.
//! A slot is an `Arc<tokio::sync::Mutex<Option<Connection>>>`; locking it
//! serializes exchanges on that peer and makes connect-or-reuse atomic per key.
//! Table locks themselves are only held for map access, never across I/O.

use super::connection::{Connection, Peer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// One peer's connection, guarded for the duration of an exchange.
pub type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// Exclusive access to a peer's slot.
pub type ConnectionLease = OwnedMutexGuard<Option<Connection>>;

/// Instance locations and per-peer connections, shared by every invoker and
/// admin facade built on it.
#[derive(Debug, Default)]
pub struct LocationCache {
    locations: RwLock<HashMap<String, String>>,
    connections: Mutex<HashMap<Peer, ConnectionSlot>>,
    local_node_id: OnceLock<String>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // Instance locations

    /// Node currently believed to host an instance.
    pub fn node_for(&self, instance_id: &str) -> Option<String> {
        self.read_locations().get(instance_id).cloned()
    }

    /// Record (or overwrite) where an instance runs.
    pub fn record_location(&self, instance_id: &str, node_id: &str) {
        let previous = self
            .write_locations()
            .insert(instance_id.to_string(), node_id.to_string());
        match previous {
            Some(old) if old != node_id => {
                debug!("Instance {} moved from {} to {}", instance_id, old, node_id)
            }
            None => debug!("Instance {} located on {}", instance_id, node_id),
            _ => {}
        }
    }

    /// Drop an instance's entry, returning the node it pointed at.
    pub fn forget_location(&self, instance_id: &str) -> Option<String> {
        self.write_locations().remove(instance_id)
    }

    /// Repoint every instance cached on `from` to `to`. Returns how many moved.
    pub fn move_all(&self, from: &str, to: &str) -> usize {
        let mut locations = self.write_locations();
        let mut moved = 0;
        for node in locations.values_mut().filter(|node| node.as_str() == from) {
            *node = to.to_string();
            moved += 1;
        }
        if moved > 0 {
            debug!("Moved {} cached instances from {} to {}", moved, from, to);
        }
        moved
    }

    /// Instances cached on a node.
    pub fn instances_on(&self, node_id: &str) -> Vec<String> {
        let mut instances: Vec<String> = self
            .read_locations()
            .iter()
            .filter(|(_, node)| node.as_str() == node_id)
            .map(|(instance, _)| instance.clone())
            .collect();
        instances.sort();
        instances
    }

    pub fn location_count(&self) -> usize {
        self.read_locations().len()
    }

    // Local node identity

    /// Record the node id learned from the first successful handshake.
    /// Later calls leave it unchanged.
    pub fn observe_local_node(&self, node_id: &str) {
        if self.local_node_id.set(node_id.to_string()).is_ok() {
            debug!("Local node id is {}", node_id);
        }
    }

    pub fn local_node_id(&self) -> Option<&str> {
        self.local_node_id.get().map(String::as_str)
    }

    /// Map a node id to the peer that serves it, short-cutting the local node.
    pub fn peer_for(&self, node_id: &str) -> Peer {
        if self.local_node_id() == Some(node_id) {
            Peer::LocalKernel
        } else {
            Peer::Node(node_id.to_string())
        }
    }

    // Connections

    /// The slot for a peer, created empty on first use.
    pub fn slot(&self, peer: &Peer) -> ConnectionSlot {
        let mut connections = self.lock_connections();
        connections
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Lock a peer's slot for one exchange.
    pub async fn lease(&self, peer: &Peer) -> ConnectionLease {
        self.slot(peer).lock_owned().await
    }

    /// Remove a peer's slot. Holders of an existing lease keep their connection
    /// until they release it; the next lease starts from an empty slot.
    pub fn invalidate(&self, peer: &Peer) {
        if self.lock_connections().remove(peer).is_some() {
            debug!("Invalidated cached connection for {:?}", peer);
        }
    }

    pub fn has_slot(&self, peer: &Peer) -> bool {
        self.lock_connections().contains_key(peer)
    }

    fn read_locations(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.locations.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_locations(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.locations.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<Peer, ConnectionSlot>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}
