//! Signaling WebSocket endpoint.
//!
//! Each accepted upgrade runs two tasks: a reader loop decoding inbound
//! `SignalMessage`s and handing them to the relay, and a writer task draining
//! the connection's outbound queue into the socket under a bounded write
//! deadline, so one slow recipient cannot hold up routing for anyone else.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use tracker_types::SignalMessage;

use crate::server::{ApiError, SharedState};

/// Deadline for a single outbound socket write.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub peer_id: String,
}

pub async fn handle_ws_upgrade(
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let peer_id = query.peer_id.trim().to_string();
    if peer_id.is_empty() {
        return Err(ApiError::bad_request("missing peer_id"));
    }

    // Connections carry peer identity only; the id must reference a
    // registered peer.
    let numeric_id = peer_id
        .parse::<u64>()
        .map_err(|_| ApiError::bad_request("invalid peer_id format"))?;
    if !state.registry.exists(numeric_id)? {
        return Err(ApiError::not_found(format!("unknown peer {numeric_id}")));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(state, peer_id, socket)))
}

async fn handle_socket(state: SharedState, peer_id: String, socket: WebSocket) {
    let connection = state.relay.register(&peer_id);
    let serial = connection.serial;
    let mut outbound = connection.outbound;

    let (mut sink, mut stream) = socket.split();

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(payload))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(peer_id = %writer_peer, %err, "socket write failed");
                    break;
                }
                Err(_) => {
                    warn!(peer_id = %writer_peer, "socket write deadline exceeded");
                    break;
                }
            }
        }
        // Queue closed (disconnect or supersession): close the socket so the
        // peer's read side learns about it.
        let _ = sink.close().await;
    });

    // Reader loop: runs until Closed. Any read failure or close frame is the
    // path to deregistration.
    while let Some(inbound) = stream.next().await {
        match inbound {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                Ok(message) => state.relay.route(&peer_id, message),
                Err(err) => {
                    warn!(peer_id = %peer_id, %err, "invalid signaling message, ignoring");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(peer_id = %peer_id, %err, "socket read failed");
                break;
            }
        }
    }

    state.relay.deregister(&peer_id, serial);
    writer.abort();
}
