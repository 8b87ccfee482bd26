//! Peer registry: identity and port assignment.
//!
//! Ports are allocated from a monotonic in-memory allocator seeded from the
//! persisted maximum at startup and advanced under a single lock, so two
//! concurrent registrations can never observe the same "current maximum" and
//! collide. The first peer gets port 9000.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use tracker_storage::Storage;
use tracker_types::{Peer, PeerId};
use tracker_vault::FileVault;

/// Port below the first assigned one.
pub const BASE_PORT: u16 = 8999;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Storage error: {0}")]
    Storage(String),
}

struct Allocator {
    next_id: PeerId,
    next_port: u16,
}

/// Owns peer identity and network address assignment.
pub struct PeerRegistry {
    storage: Arc<dyn Storage>,
    vault: FileVault,
    allocator: Mutex<Allocator>,
}

impl PeerRegistry {
    /// Seed the allocator from the persisted maxima. Fails only when storage
    /// is unreadable, which is an unrecoverable startup condition.
    pub fn new(storage: Arc<dyn Storage>, vault: FileVault) -> Result<Self, RegistryError> {
        let max_id = storage
            .max_peer_id()
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        let max_port = storage
            .max_assigned_port()
            .map_err(|e| RegistryError::Storage(e.to_string()))?
            .unwrap_or(BASE_PORT);
        let next_port = max_port
            .checked_add(1)
            .ok_or_else(|| RegistryError::Storage("assignable port space exhausted".to_string()))?;

        Ok(Self {
            storage,
            vault,
            allocator: Mutex::new(Allocator {
                next_id: max_id + 1,
                next_port,
            }),
        })
    }

    /// Register a peer at `address`, assigning a fresh identity and the next
    /// free port. Identity, workspace directory and peer row commit as one
    /// unit: when directory provisioning fails no peer is persisted and the
    /// allocator does not advance.
    pub fn register(&self, address: &str) -> Result<Peer, RegistryError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(RegistryError::InvalidAddress(
                "address must not be empty".to_string(),
            ));
        }

        let mut alloc = self.allocator.lock();
        // Reserve the successor up front so the allocator can never wrap the
        // u16 port space; the last port stays unassigned.
        let next_port = alloc
            .next_port
            .checked_add(1)
            .ok_or_else(|| RegistryError::Storage("assignable port space exhausted".to_string()))?;
        let peer = Peer {
            id: alloc.next_id,
            address: address.to_string(),
            port: alloc.next_port,
        };

        // Workspace first: a peer row without a creatable directory must not
        // exist.
        self.vault
            .provision_peer_dir(peer.id)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        self.storage
            .insert_peer(peer.clone())
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        alloc.next_id += 1;
        alloc.next_port = next_port;
        drop(alloc);

        info!(peer_id = peer.id, address = %peer.address, port = peer.port, "registered peer");
        Ok(peer)
    }

    /// All registered peers, order insignificant.
    pub fn list(&self) -> Result<Vec<Peer>, RegistryError> {
        self.storage
            .list_peers()
            .map_err(|e| RegistryError::Storage(e.to_string()))
    }

    pub fn get(&self, id: PeerId) -> Result<Option<Peer>, RegistryError> {
        self.storage
            .get_peer(id)
            .map_err(|e| RegistryError::Storage(e.to_string()))
    }

    /// Reference check used before creating possession edges or connections.
    pub fn exists(&self, id: PeerId) -> Result<bool, RegistryError> {
        self.storage
            .peer_exists(id)
            .map_err(|e| RegistryError::Storage(e.to_string()))
    }

    /// Remove a peer; its possession edges cascade away with it.
    pub fn deregister(&self, id: PeerId) -> Result<(), RegistryError> {
        if !self.exists(id)? {
            return Err(RegistryError::UnknownPeer(id));
        }
        self.storage
            .remove_peer(id)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        info!(peer_id = id, "deregistered peer");
        Ok(())
    }
}
