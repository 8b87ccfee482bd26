//! Signaling relay: routes ad-hoc messages between live peer connections.
//!
//! The relay owns the process-wide `peer id -> outbound channel` registry.
//! It is instantiated once at startup and holds no global state; the map is
//! guarded by a mutex held only for insert/delete/lookup/snapshot, never
//! across a delivery. Deliveries go through per-connection unbounded queues so
//! a slow recipient's socket cannot stall the relay or other peers; the
//! transport-side writer task applies its own write deadline.
//!
//! Connection lifecycle is Connecting -> Open -> Closed: `register` is the
//! Open transition, `deregister` (read failure, explicit close, or
//! supersession) is the only path to Closed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracker_types::SignalMessage;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Recipient queue closed: {0}")]
    QueueClosed(String),
}

struct ConnectionHandle {
    serial: u64,
    outbound: mpsc::UnboundedSender<String>,
}

/// Handle for one open connection, owned by its transport task. Dropping the
/// receiver (or the relay closing it on supersession) ends the connection's
/// writer loop.
pub struct RelayConnection {
    pub peer_id: String,
    pub serial: u64,
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// In-memory message router, independent of persisted state.
pub struct SignalRelay {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    next_serial: AtomicU64,
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRelay {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Open a connection for `peer_id`. At most one connection per peer is
    /// live: an existing one is explicitly closed, then replaced. Its
    /// outbound queue closes, its writer drains and exits, and its eventual
    /// deregistration is a no-op thanks to the serial check.
    pub fn register(&self, peer_id: &str) -> RelayConnection {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let superseded = {
            let mut connections = self.connections.lock();
            connections.insert(
                peer_id.to_string(),
                ConnectionHandle {
                    serial,
                    outbound: tx,
                },
            )
        };
        if superseded.is_some() {
            warn!(peer_id, "superseding existing signaling connection");
        }
        debug!(peer_id, serial, "signaling connection open");

        RelayConnection {
            peer_id: peer_id.to_string(),
            serial,
            outbound: rx,
        }
    }

    /// Close the mapping for `peer_id`, but only when `serial` still matches:
    /// a superseded connection cleaning up after itself must not evict its
    /// successor.
    pub fn deregister(&self, peer_id: &str, serial: u64) {
        let mut connections = self.connections.lock();
        if connections
            .get(peer_id)
            .map(|handle| handle.serial == serial)
            .unwrap_or(false)
        {
            connections.remove(peer_id);
            debug!(peer_id, serial, "signaling connection closed");
        }
    }

    /// Route one inbound message from `sender_id` according to its kind.
    pub fn route(&self, sender_id: &str, message: SignalMessage) {
        match message {
            SignalMessage::Broadcast { message } => self.broadcast(sender_id, &message),
            SignalMessage::Direct { target, message } => {
                // Fire-and-forget: an absent target is not an error the
                // sender learns about.
                if let Err(err) = self.send_direct(&target, &message) {
                    debug!(sender_id, target, %err, "direct message dropped");
                }
            }
            SignalMessage::Unknown => {
                warn!(sender_id, "ignoring signaling message of unknown kind");
            }
        }
    }

    /// Deliver to every other open connection, best-effort: one dead
    /// recipient queue is logged and skipped, the rest still get the payload.
    fn broadcast(&self, sender_id: &str, payload: &str) {
        let recipients: Vec<(String, mpsc::UnboundedSender<String>)> = {
            let connections = self.connections.lock();
            connections
                .iter()
                .filter(|(peer_id, _)| peer_id.as_str() != sender_id)
                .map(|(peer_id, handle)| (peer_id.clone(), handle.outbound.clone()))
                .collect()
        };

        for (peer_id, outbound) in recipients {
            if outbound.send(payload.to_string()).is_err() {
                warn!(sender_id, recipient = %peer_id, "broadcast delivery failed");
            }
        }
    }

    fn send_direct(&self, target: &str, payload: &str) -> Result<(), ConnectionError> {
        let outbound = {
            let connections = self.connections.lock();
            match connections.get(target) {
                Some(handle) => handle.outbound.clone(),
                None => {
                    return Err(ConnectionError::QueueClosed(format!(
                        "no open connection for {target}"
                    )))
                }
            }
        };
        outbound
            .send(payload.to_string())
            .map_err(|_| ConnectionError::QueueClosed(target.to_string()))
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.connections.lock().contains_key(peer_id)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let relay = Arc::new(SignalRelay::new());
        let mut c1 = relay.register("1");
        let mut c2 = relay.register("2");
        let mut c3 = relay.register("3");

        relay.route("1", SignalMessage::Broadcast {
            message: "have file X".to_string(),
        });

        assert_eq!(c2.outbound.recv().await.unwrap(), "have file X");
        assert_eq!(c3.outbound.recv().await.unwrap(), "have file X");
        assert!(c1.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_delivers_to_target_only() {
        let relay = Arc::new(SignalRelay::new());
        let mut c1 = relay.register("1");
        let mut c2 = relay.register("2");

        relay.route("1", SignalMessage::Direct {
            target: "2".to_string(),
            message: "hi".to_string(),
        });

        assert_eq!(c2.outbound.recv().await.unwrap(), "hi");
        assert!(c1.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_direct_to_absent_target_is_silent() {
        let relay = Arc::new(SignalRelay::new());
        let mut c1 = relay.register("1");

        relay.route("1", SignalMessage::Direct {
            target: "404".to_string(),
            message: "void".to_string(),
        });

        assert!(c1.outbound.try_recv().is_err());
        assert_eq!(relay.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_keeps_connection_open() {
        let relay = Arc::new(SignalRelay::new());
        let mut c1 = relay.register("1");

        relay.route("1", SignalMessage::Unknown);

        assert!(relay.is_open("1"));
        assert!(c1.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_supersession_closes_prior_channel() {
        let relay = Arc::new(SignalRelay::new());
        let mut old = relay.register("1");
        let mut new = relay.register("1");

        // The old outbound queue is closed; its writer loop would drain and
        // exit here.
        assert!(old.outbound.recv().await.is_none());

        relay.route("2", SignalMessage::Broadcast {
            message: "after".to_string(),
        });
        assert_eq!(new.outbound.recv().await.unwrap(), "after");
        assert_eq!(relay.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_stale_deregistration_cannot_evict_successor() {
        let relay = Arc::new(SignalRelay::new());
        let old = relay.register("1");
        let new = relay.register("1");

        relay.deregister("1", old.serial);
        assert!(relay.is_open("1"));

        relay.deregister("1", new.serial);
        assert!(!relay.is_open("1"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_recipient_queue() {
        let relay = Arc::new(SignalRelay::new());
        let _c1 = relay.register("1");
        let c2 = relay.register("2");
        let mut c3 = relay.register("3");

        // Recipient 2's transport died without deregistering yet.
        drop(c2);

        relay.route("1", SignalMessage::Broadcast {
            message: "still delivered".to_string(),
        });
        assert_eq!(c3.outbound.recv().await.unwrap(), "still delivered");
    }
}
