//! Core data model for the p2p-tracker coordinator.
//!
//! Shared between the storage layer, the coordination components and the HTTP
//! surface: peer identity, content-addressed file records and the signaling
//! message wire enum.

pub mod content;
pub mod peer;
pub mod signal;

pub use content::{ContentHash, ContentRecord};
pub use peer::{Peer, PeerAddr, PeerId};
pub use signal::SignalMessage;
