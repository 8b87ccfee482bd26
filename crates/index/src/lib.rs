//! Content index: hash -> metadata and hash -> peer-set mappings.
//!
//! Identity is content, not name: a record is created once per distinct hash
//! and later uploads of the same bytes reuse it. Possession edges are
//! idempotent and only ever reference peers the registry knows about.

use std::sync::Arc;
use tracing::debug;
use tracker_storage::Storage;
use tracker_types::{ContentHash, ContentRecord, Peer, PeerId};

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Unknown content record: {0}")]
    UnknownContent(u64),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Owns the file-hash -> metadata and file-hash -> peer-set mappings.
pub struct ContentIndex {
    storage: Arc<dyn Storage>,
}

impl ContentIndex {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Dedup contract: return the existing record for `hash` unchanged, or
    /// create a new one with the caller's metadata.
    pub fn upsert(
        &self,
        hash: ContentHash,
        display_name: &str,
        size: u64,
    ) -> Result<ContentRecord, IndexError> {
        let record = self
            .storage
            .upsert_content(hash, display_name, size)
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        debug!(file_id = record.id, hash = %record.hash, "content upserted");
        Ok(record)
    }

    /// Idempotent insert of a possession edge. The peer must exist; the edge
    /// being present already is a no-op, not an error.
    pub fn add_possession(&self, file_id: u64, peer_id: PeerId) -> Result<(), IndexError> {
        let peer_known = self
            .storage
            .peer_exists(peer_id)
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        if !peer_known {
            return Err(IndexError::UnknownPeer(peer_id));
        }
        let content_known = self
            .storage
            .get_content(file_id)
            .map_err(|e| IndexError::Storage(e.to_string()))?
            .is_some();
        if !content_known {
            return Err(IndexError::UnknownContent(file_id));
        }
        self.storage
            .add_possession(file_id, peer_id)
            .map_err(|e| IndexError::Storage(e.to_string()))
    }

    /// All peers currently possessing content with this hash. An unknown hash
    /// yields an empty list, never an error: callers cannot distinguish "no
    /// sources yet" from "unknown hash".
    pub fn sources_for(&self, hash: &ContentHash) -> Result<Vec<Peer>, IndexError> {
        let record = match self
            .storage
            .get_content_by_hash(hash)
            .map_err(|e| IndexError::Storage(e.to_string()))?
        {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };

        let mut sources = Vec::new();
        for peer_id in self
            .storage
            .holders_of(record.id)
            .map_err(|e| IndexError::Storage(e.to_string()))?
        {
            if let Some(peer) = self
                .storage
                .get_peer(peer_id)
                .map_err(|e| IndexError::Storage(e.to_string()))?
            {
                sources.push(peer);
            }
        }
        Ok(sources)
    }

    pub fn record_for(&self, hash: &ContentHash) -> Result<Option<ContentRecord>, IndexError> {
        self.storage
            .get_content_by_hash(hash)
            .map_err(|e| IndexError::Storage(e.to_string()))
    }

    /// All content the peer possesses.
    pub fn files_for(&self, peer_id: PeerId) -> Result<Vec<ContentRecord>, IndexError> {
        let mut files = Vec::new();
        for file_id in self
            .storage
            .held_by(peer_id)
            .map_err(|e| IndexError::Storage(e.to_string()))?
        {
            if let Some(record) = self
                .storage
                .get_content(file_id)
                .map_err(|e| IndexError::Storage(e.to_string()))?
            {
                files.push(record);
            }
        }
        Ok(files)
    }

    pub fn all_files(&self) -> Result<Vec<ContentRecord>, IndexError> {
        self.storage
            .all_content()
            .map_err(|e| IndexError::Storage(e.to_string()))
    }
}
