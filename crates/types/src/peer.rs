//! Peer identity and address records.

use serde::{Deserialize, Serialize};

/// Identity assigned once at registration, immutable thereafter.
pub type PeerId = u64;

/// A registered peer. The port is allocated by the registry, never chosen by
/// the peer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub address: String,
    pub port: u16,
}

/// Address-and-port projection of a peer, as returned by source lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub address: String,
    pub port: u16,
}

impl From<&Peer> for PeerAddr {
    fn from(peer: &Peer) -> Self {
        Self {
            address: peer.address.clone(),
            port: peer.port,
        }
    }
}
