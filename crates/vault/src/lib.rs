//! On-disk blob store for peer workspaces.
//!
//! Each registered peer owns a directory under the vault root; uploads and
//! orchestrated downloads land there as plain files. Hashing always reads the
//! bytes that actually hit the disk, never a caller-advertised digest.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracker_types::{ContentHash, PeerId};

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid file name: {0}")]
    InvalidName(String),
    #[error("Blob not found: {0}")]
    NotFound(String),
}

/// Durable blob store rooted at a single directory, one subdirectory per peer.
#[derive(Debug, Clone)]
pub struct FileVault {
    root: PathBuf,
}

impl FileVault {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn peer_dir(&self, peer_id: PeerId) -> PathBuf {
        self.root.join(format!("peer_{peer_id}"))
    }

    /// Provision the workspace directory for a newly registered peer. The
    /// registry calls this before committing the peer row; a failure here
    /// aborts the whole registration.
    pub fn provision_peer_dir(&self, peer_id: PeerId) -> Result<(), VaultError> {
        std::fs::create_dir_all(self.peer_dir(peer_id))?;
        Ok(())
    }

    /// Resolve the on-disk path for a stored blob, verifying the name does not
    /// escape the peer's directory.
    pub fn blob_path(&self, peer_id: PeerId, name: &str) -> Result<PathBuf, VaultError> {
        let name = sanitize_name(name)?;
        Ok(self.peer_dir(peer_id).join(name))
    }

    /// Durably write `bytes` under the peer's workspace, returning the number
    /// of bytes written.
    pub async fn persist(
        &self,
        peer_id: PeerId,
        name: &str,
        bytes: &[u8],
    ) -> Result<u64, VaultError> {
        let path = self.blob_path(peer_id, name)?;
        tokio::fs::create_dir_all(self.peer_dir(peer_id)).await?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(peer_id, name, size = bytes.len(), "persisted blob");
        Ok(bytes.len() as u64)
    }

    /// Read a stored blob back in full.
    pub async fn read(&self, peer_id: PeerId, name: &str) -> Result<Vec<u8>, VaultError> {
        let path = self.blob_path(peer_id, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Re-hash the bytes that actually landed on disk. Used as the integrity
    /// check after an orchestrated transfer: never trust the advertised hash.
    pub async fn hash_file(&self, peer_id: PeerId, name: &str) -> Result<ContentHash, VaultError> {
        let path = self.blob_path(peer_id, name)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(path.display().to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(ContentHash::from_bytes(hasher.finalize().into()))
    }
}

/// Deterministic content hash over a full byte slice.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash::from_data(bytes)
}

fn sanitize_name(name: &str) -> Result<&str, VaultError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name == "."
        || name == ".."
    {
        return Err(VaultError::InvalidName(name.to_string()));
    }
    Ok(name)
}
