//! Signaling message wire format.

use serde::{Deserialize, Serialize};

/// A transient message exchanged over a live signaling connection.
///
/// Closed tagged variant: unrecognized kinds decode to `Unknown` and are
/// ignored by the relay instead of silently falling through string matching.
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Deliver the payload to every other open connection.
    Broadcast { message: String },
    /// Deliver the payload to the connection registered under `target` only.
    Direct { target: String, message: String },
    /// Any kind the relay does not understand. Logged and dropped, the
    /// connection stays open.
    #[serde(other)]
    Unknown,
}
