use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use sled::{Db, Tree};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracker_types::{ContentHash, ContentRecord, Peer, PeerId};

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Peer not found")]
    PeerNotFound,
    #[error("Content not found")]
    ContentNotFound,
}

/// Abstract storage trait for the coordinator's persistent state: peers,
/// content records and possession edges. Each mutation is individually atomic;
/// no transaction spans more than one operation.
pub trait Storage: Send + Sync {
    fn insert_peer(&self, peer: Peer) -> Result<()>;
    fn get_peer(&self, id: PeerId) -> Result<Option<Peer>>;
    fn list_peers(&self) -> Result<Vec<Peer>>;
    fn peer_exists(&self, id: PeerId) -> Result<bool>;
    /// Remove a peer and cascade removal of its possession edges.
    fn remove_peer(&self, id: PeerId) -> Result<()>;
    /// Highest peer id ever assigned, 0 when no peer exists.
    fn max_peer_id(&self) -> Result<u64>;
    /// Highest port ever assigned, `None` when no peer exists.
    fn max_assigned_port(&self) -> Result<Option<u16>>;

    /// Content-addressed upsert: return the existing record for `hash`
    /// unchanged, or create a new one. The first uploader's display name and
    /// size win.
    fn upsert_content(&self, hash: ContentHash, display_name: &str, size: u64)
        -> Result<ContentRecord>;
    fn get_content(&self, id: u64) -> Result<Option<ContentRecord>>;
    fn get_content_by_hash(&self, hash: &ContentHash) -> Result<Option<ContentRecord>>;
    fn all_content(&self) -> Result<Vec<ContentRecord>>;
    /// Remove a content record and cascade removal of its possession edges.
    fn remove_content(&self, id: u64) -> Result<()>;

    /// Idempotent insert of a possession edge; re-adding is a no-op.
    fn add_possession(&self, file_id: u64, peer_id: PeerId) -> Result<()>;
    fn holders_of(&self, file_id: u64) -> Result<Vec<PeerId>>;
    fn held_by(&self, peer_id: PeerId) -> Result<Vec<u64>>;
}

const NEXT_FILE_ID_KEY: &[u8] = b"next_file_id";

fn possession_key(file_id: u64, peer_id: PeerId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&file_id.to_be_bytes());
    key[8..].copy_from_slice(&peer_id.to_be_bytes());
    key
}

/// Sled-backed implementation
pub struct SledStorage {
    db: Db,
    peers: Tree,
    files: Tree,
    file_hashes: Tree,
    possessions: Tree,
    metadata: Tree,
    /// Serializes content upsert (hash lookup + id allocation + insert) so two
    /// concurrent uploads of the same bytes cannot create two records.
    upsert_lock: Mutex<()>,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let peers = db.open_tree("peers")?;
        let files = db.open_tree("files")?;
        let file_hashes = db.open_tree("file_hashes")?;
        let possessions = db.open_tree("possessions")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            peers,
            files,
            file_hashes,
            possessions,
            metadata,
            upsert_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_file_id(&self) -> Result<u64> {
        // Caller holds upsert_lock.
        let next = self
            .metadata
            .get(NEXT_FILE_ID_KEY)?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(1);
        self.metadata
            .insert(NEXT_FILE_ID_KEY, &(next + 1).to_be_bytes())?;
        Ok(next)
    }
}

impl Storage for SledStorage {
    fn insert_peer(&self, peer: Peer) -> Result<()> {
        let data = serde_json::to_vec(&peer)?;
        self.peers.insert(peer.id.to_be_bytes(), data)?;
        Ok(())
    }

    fn get_peer(&self, id: PeerId) -> Result<Option<Peer>> {
        self.peers
            .get(id.to_be_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn list_peers(&self) -> Result<Vec<Peer>> {
        self.peers
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<Peer>(&v)?)
            })
            .collect()
    }

    fn peer_exists(&self, id: PeerId) -> Result<bool> {
        Ok(self.peers.contains_key(id.to_be_bytes())?)
    }

    fn remove_peer(&self, id: PeerId) -> Result<()> {
        if self.peers.remove(id.to_be_bytes())?.is_none() {
            return Err(StorageError::PeerNotFound.into());
        }
        // Cascade: drop every possession edge referencing this peer.
        let mut stale = Vec::new();
        for entry in self.possessions.iter() {
            let (key, _) = entry?;
            if key.len() == 16 && key[8..] == id.to_be_bytes() {
                stale.push(key);
            }
        }
        for key in stale {
            self.possessions.remove(key)?;
        }
        Ok(())
    }

    fn max_peer_id(&self) -> Result<u64> {
        Ok(self
            .peers
            .last()?
            .map(|(k, _)| u64::from_be_bytes(k.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0))
    }

    fn max_assigned_port(&self) -> Result<Option<u16>> {
        let mut max = None;
        for entry in self.peers.iter() {
            let (_, v) = entry?;
            let peer: Peer = serde_json::from_slice(&v)?;
            if max.map(|m| peer.port > m).unwrap_or(true) {
                max = Some(peer.port);
            }
        }
        Ok(max)
    }

    fn upsert_content(
        &self,
        hash: ContentHash,
        display_name: &str,
        size: u64,
    ) -> Result<ContentRecord> {
        let _guard = self.upsert_lock.lock();

        if let Some(id_bytes) = self.file_hashes.get(hash.as_bytes())? {
            let id = u64::from_be_bytes(id_bytes.as_ref().try_into().unwrap_or([0u8; 8]));
            return self
                .get_content(id)?
                .ok_or_else(|| StorageError::ContentNotFound.into());
        }

        let record = ContentRecord {
            id: self.next_file_id()?,
            hash,
            display_name: display_name.to_string(),
            size,
        };
        self.files
            .insert(record.id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        self.file_hashes
            .insert(hash.as_bytes(), &record.id.to_be_bytes())?;
        Ok(record)
    }

    fn get_content(&self, id: u64) -> Result<Option<ContentRecord>> {
        self.files
            .get(id.to_be_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn get_content_by_hash(&self, hash: &ContentHash) -> Result<Option<ContentRecord>> {
        match self.file_hashes.get(hash.as_bytes())? {
            Some(id_bytes) => {
                let id = u64::from_be_bytes(id_bytes.as_ref().try_into().unwrap_or([0u8; 8]));
                self.get_content(id)
            }
            None => Ok(None),
        }
    }

    fn all_content(&self) -> Result<Vec<ContentRecord>> {
        self.files
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<ContentRecord>(&v)?)
            })
            .collect()
    }

    fn remove_content(&self, id: u64) -> Result<()> {
        let record = self
            .get_content(id)?
            .ok_or(StorageError::ContentNotFound)?;
        self.files.remove(id.to_be_bytes())?;
        self.file_hashes.remove(record.hash.as_bytes())?;
        // Cascade: edges are keyed by file id prefix.
        let mut stale = Vec::new();
        for entry in self.possessions.scan_prefix(id.to_be_bytes()) {
            let (key, _) = entry?;
            stale.push(key);
        }
        for key in stale {
            self.possessions.remove(key)?;
        }
        Ok(())
    }

    fn add_possession(&self, file_id: u64, peer_id: PeerId) -> Result<()> {
        self.possessions
            .insert(possession_key(file_id, peer_id), vec![])?;
        Ok(())
    }

    fn holders_of(&self, file_id: u64) -> Result<Vec<PeerId>> {
        let mut holders = Vec::new();
        for entry in self.possessions.scan_prefix(file_id.to_be_bytes()) {
            let (key, _) = entry?;
            if key.len() == 16 {
                holders.push(u64::from_be_bytes(key[8..].try_into().unwrap_or([0u8; 8])));
            }
        }
        Ok(holders)
    }

    fn held_by(&self, peer_id: PeerId) -> Result<Vec<u64>> {
        let mut files = Vec::new();
        for entry in self.possessions.iter() {
            let (key, _) = entry?;
            if key.len() == 16 && key[8..] == peer_id.to_be_bytes() {
                files.push(u64::from_be_bytes(key[..8].try_into().unwrap_or([0u8; 8])));
            }
        }
        Ok(files)
    }
}

/// In-memory testing backend
#[derive(Default)]
pub struct MemoryStorage {
    peers: RwLock<HashMap<PeerId, Peer>>,
    files: RwLock<HashMap<u64, ContentRecord>>,
    file_hashes: RwLock<HashMap<ContentHash, u64>>,
    possessions: RwLock<HashSet<(u64, PeerId)>>,
    next_file_id: Mutex<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            next_file_id: Mutex::new(1),
            ..Default::default()
        }
    }
}

impl Storage for MemoryStorage {
    fn insert_peer(&self, peer: Peer) -> Result<()> {
        self.peers.write().insert(peer.id, peer);
        Ok(())
    }

    fn get_peer(&self, id: PeerId) -> Result<Option<Peer>> {
        Ok(self.peers.read().get(&id).cloned())
    }

    fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.peers.read().values().cloned().collect())
    }

    fn peer_exists(&self, id: PeerId) -> Result<bool> {
        Ok(self.peers.read().contains_key(&id))
    }

    fn remove_peer(&self, id: PeerId) -> Result<()> {
        if self.peers.write().remove(&id).is_none() {
            return Err(StorageError::PeerNotFound.into());
        }
        self.possessions.write().retain(|(_, p)| *p != id);
        Ok(())
    }

    fn max_peer_id(&self) -> Result<u64> {
        Ok(self.peers.read().keys().copied().max().unwrap_or(0))
    }

    fn max_assigned_port(&self) -> Result<Option<u16>> {
        Ok(self.peers.read().values().map(|p| p.port).max())
    }

    fn upsert_content(
        &self,
        hash: ContentHash,
        display_name: &str,
        size: u64,
    ) -> Result<ContentRecord> {
        let mut next_id = self.next_file_id.lock();

        if let Some(id) = self.file_hashes.read().get(&hash) {
            let existing = self.files.read().get(id).cloned();
            return existing.ok_or_else(|| StorageError::ContentNotFound.into());
        }

        let record = ContentRecord {
            id: *next_id,
            hash,
            display_name: display_name.to_string(),
            size,
        };
        *next_id += 1;
        self.files.write().insert(record.id, record.clone());
        self.file_hashes.write().insert(hash, record.id);
        Ok(record)
    }

    fn get_content(&self, id: u64) -> Result<Option<ContentRecord>> {
        Ok(self.files.read().get(&id).cloned())
    }

    fn get_content_by_hash(&self, hash: &ContentHash) -> Result<Option<ContentRecord>> {
        let id = match self.file_hashes.read().get(hash) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_content(id)
    }

    fn all_content(&self) -> Result<Vec<ContentRecord>> {
        Ok(self.files.read().values().cloned().collect())
    }

    fn remove_content(&self, id: u64) -> Result<()> {
        let record = self
            .files
            .write()
            .remove(&id)
            .ok_or(StorageError::ContentNotFound)?;
        self.file_hashes.write().remove(&record.hash);
        self.possessions.write().retain(|(f, _)| *f != id);
        Ok(())
    }

    fn add_possession(&self, file_id: u64, peer_id: PeerId) -> Result<()> {
        self.possessions.write().insert((file_id, peer_id));
        Ok(())
    }

    fn holders_of(&self, file_id: u64) -> Result<Vec<PeerId>> {
        let mut holders: Vec<PeerId> = self
            .possessions
            .read()
            .iter()
            .filter(|(f, _)| *f == file_id)
            .map(|(_, p)| *p)
            .collect();
        holders.sort_unstable();
        Ok(holders)
    }

    fn held_by(&self, peer_id: PeerId) -> Result<Vec<u64>> {
        let mut files: Vec<u64> = self
            .possessions
            .read()
            .iter()
            .filter(|(_, p)| *p == peer_id)
            .map(|(f, _)| *f)
            .collect();
        files.sort_unstable();
        Ok(files)
    }
}
