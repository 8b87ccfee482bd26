//! Transfer orchestrator: brokers content transfers through the coordinator.
//!
//! Both paths end identically: bytes land in the requesting peer's vault
//! workspace, the bytes that actually arrived are re-hashed, and the index
//! gains an upsert plus a possession edge. A possession edge is only recorded
//! once persistence and re-hashing have both succeeded, so a partial transfer
//! never appears as possessed content.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracker_index::{ContentIndex, IndexError};
use tracker_registry::PeerRegistry;
use tracker_types::{ContentHash, ContentRecord, PeerId};
use tracker_vault::FileVault;

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Source peer unreachable, non-success response, timeout, or content
    /// that does not hash to what the source advertised. Retryable.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<IndexError> for TransferError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::UnknownPeer(id) => TransferError::NotFound(format!("unknown peer {id}")),
            IndexError::UnknownContent(id) => {
                TransferError::NotFound(format!("unknown content record {id}"))
            }
            IndexError::Storage(msg) => TransferError::Storage(msg),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Fixed port every peer serves its files on (`/files/{peer}/{name}`).
    pub file_port: u16,
    /// Upper bound on one orchestrated fetch, connection included.
    pub fetch_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            file_port: 9000,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Coordinates a peer fetching content from another peer on the coordinator's
/// behalf, keeping the index authoritative.
pub struct TransferOrchestrator {
    registry: Arc<PeerRegistry>,
    index: Arc<ContentIndex>,
    vault: FileVault,
    client: reqwest::Client,
    config: TransferConfig,
}

impl TransferOrchestrator {
    pub fn new(
        registry: Arc<PeerRegistry>,
        index: Arc<ContentIndex>,
        vault: FileVault,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| TransferError::Storage(format!("http client init failed: {e}")))?;

        Ok(Self {
            registry,
            index,
            vault,
            client,
            config,
        })
    }

    /// Record a direct upload: persist the bytes under the peer's workspace,
    /// hash what was written, then upsert + possession.
    pub async fn record_upload(
        &self,
        peer_id: PeerId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<ContentRecord, TransferError> {
        if filename.trim().is_empty() {
            return Err(TransferError::Validation(
                "filename must not be empty".to_string(),
            ));
        }
        let peer_known = self
            .registry
            .exists(peer_id)
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        if !peer_known {
            return Err(TransferError::NotFound(format!("unknown peer {peer_id}")));
        }

        let size = self
            .vault
            .persist(peer_id, filename, bytes)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        let hash = self
            .vault
            .hash_file(peer_id, filename)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;

        let record = self.index.upsert(hash, filename, size)?;
        self.index.add_possession(record.id, peer_id)?;
        info!(peer_id, file_id = record.id, hash = %record.hash, "upload recorded");
        Ok(record)
    }

    /// Fetch `filename` from `source` on behalf of `requester` and index the
    /// result exactly as a direct upload.
    ///
    /// When `expected` is `None` and the source advertises a record under the
    /// same display name, that record's hash is used as the advertised one.
    /// The received bytes are always independently re-hashed; a mismatch with
    /// the advertised hash is treated as a lying or corrupt upstream.
    pub async fn orchestrate_download(
        &self,
        requester: PeerId,
        source: PeerId,
        filename: &str,
        expected: Option<ContentHash>,
    ) -> Result<ContentRecord, TransferError> {
        if filename.trim().is_empty() {
            return Err(TransferError::Validation(
                "filename must not be empty".to_string(),
            ));
        }
        let requester_known = self
            .registry
            .exists(requester)
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        if !requester_known {
            return Err(TransferError::NotFound(format!(
                "unknown requesting peer {requester}"
            )));
        }
        let source_peer = self
            .registry
            .get(source)
            .map_err(|e| TransferError::Storage(e.to_string()))?
            .ok_or_else(|| TransferError::NotFound(format!("unknown source peer {source}")))?;

        let advertised = match expected {
            Some(hash) => Some(hash),
            None => self
                .index
                .files_for(source)?
                .into_iter()
                .find(|record| record.display_name == filename)
                .map(|record| record.hash),
        };

        let url = format!(
            "http://{}:{}/files/{}/{}",
            source_peer.address, self.config.file_port, source, filename
        );
        debug!(requester, source, %url, "fetching from source peer");

        let response = self.client.get(&url).send().await.map_err(|e| {
            TransferError::UpstreamUnavailable(format!("fetch from {url} failed: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(TransferError::UpstreamUnavailable(format!(
                "source returned {} for {url}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(|e| {
            TransferError::UpstreamUnavailable(format!("reading body from {url} failed: {e}"))
        })?;

        let size = self
            .vault
            .persist(requester, filename, &bytes)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        let actual = self
            .vault
            .hash_file(requester, filename)
            .await
            .map_err(|e| TransferError::Storage(e.to_string()))?;

        if let Some(advertised) = advertised {
            if actual != advertised {
                warn!(
                    requester,
                    source,
                    advertised = %advertised,
                    actual = %actual,
                    "content hash mismatch, transfer discarded"
                );
                return Err(TransferError::UpstreamUnavailable(format!(
                    "content hash mismatch: advertised {advertised}, received {actual}"
                )));
            }
        }

        let record = self.index.upsert(actual, filename, size)?;
        self.index.add_possession(record.id, requester)?;
        info!(
            requester,
            source,
            file_id = record.id,
            hash = %record.hash,
            "orchestrated transfer complete"
        );
        Ok(record)
    }
}
