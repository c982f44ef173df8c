//! Persistent cache of the fundamentalnode directory (`fncache.dat`).
//!
//! Layout: `[magic string][4-byte network magic][registry snapshot][sha256d]`
//! where the trailing hash covers every preceding byte. A file that fails
//! any check is never partially loaded; the directory is rebuilt from the
//! network instead.

use std::path::{Path, PathBuf};

use crate::chain::ChainView;
use crate::constants::{CACHE_FILE_NAME, CACHE_FORMAT_VERSION, CACHE_MAGIC};
use crate::registry::{Registry, RegistrySnapshot};
use crate::sha256d;

const HASH_BYTES: usize = 32;

/// Errors from reading or writing the cache file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open cache file: {0}")]
    FileError(#[source] std::io::Error),
    #[error("cache file too short to carry a checksum")]
    HashReadError,
    #[error("checksum mismatch, data corrupted")]
    IncorrectHash,
    #[error("invalid cache magic message")]
    IncorrectMagicMessage,
    #[error("invalid network magic number")]
    IncorrectMagicNumber,
    #[error("magic is ok but data has invalid format: {0}")]
    IncorrectFormat(String),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Bincode decode without the network message size limit; the checksum has
/// already vouched for the bytes.
fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map_err(|e| StoreError::IncorrectFormat(e.to_string()))
}

/// Checksummed snapshot file of the registry.
pub struct PersistentStore {
    path: PathBuf,
    network_magic: [u8; 4],
}

impl PersistentStore {
    pub fn new(path: PathBuf, network_magic: [u8; 4]) -> Self {
        PersistentStore {
            path,
            network_magic,
        }
    }

    /// The cache file inside `data_dir`.
    pub fn in_dir(data_dir: &Path, network_magic: [u8; 4]) -> Self {
        Self::new(data_dir.join(CACHE_FILE_NAME), network_magic)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode a snapshot with header and checksum.
    pub fn encode(&self, snapshot: &RegistrySnapshot) -> Result<Vec<u8>, StoreError> {
        let mut buf = crate::serialize(&CACHE_MAGIC.to_string())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        buf.extend_from_slice(&self.network_magic);
        let body = crate::serialize(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        buf.extend_from_slice(&body);
        let hash = sha256d(&buf);
        buf.extend_from_slice(&hash);
        Ok(buf)
    }

    /// Verify and decode file contents: checksum, then magic string, then
    /// network magic, then the snapshot itself.
    pub fn decode(&self, bytes: &[u8]) -> Result<RegistrySnapshot, StoreError> {
        if bytes.len() < HASH_BYTES {
            return Err(StoreError::HashReadError);
        }
        let (data, hash) = bytes.split_at(bytes.len() - HASH_BYTES);
        if sha256d(data)[..] != hash[..] {
            return Err(StoreError::IncorrectHash);
        }

        let (magic, used): (String, usize) =
            decode(data).map_err(|_| StoreError::IncorrectMagicMessage)?;
        if magic != CACHE_MAGIC {
            return Err(StoreError::IncorrectMagicMessage);
        }
        let rest = &data[used..];
        if rest.len() < 4 || rest[..4] != self.network_magic {
            return Err(StoreError::IncorrectMagicNumber);
        }

        let (snapshot, used): (RegistrySnapshot, usize) = decode(&rest[4..])?;
        if used != rest.len() - 4 {
            return Err(StoreError::IncorrectFormat("trailing bytes".into()));
        }
        if snapshot.version != CACHE_FORMAT_VERSION {
            return Err(StoreError::IncorrectFormat(format!(
                "unsupported version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    pub fn read(&self) -> Result<RegistrySnapshot, StoreError> {
        let bytes = std::fs::read(&self.path).map_err(StoreError::FileError)?;
        self.decode(&bytes)
    }

    /// Write atomically through a temporary file.
    pub fn write(&self, snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
        let bytes = self.encode(snapshot)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("dat.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Restore the registry from the file and sweep it. On any failure the
    /// registry is left untouched and `false` is returned.
    pub fn load(&self, registry: &Registry, chain: &dyn ChainView) -> bool {
        match self.read() {
            Ok(snapshot) => {
                registry.restore(snapshot);
                registry.check_and_remove(chain);
                tracing::info!(
                    path = %self.path.display(),
                    nodes = registry.len(),
                    "Loaded fundamentalnode cache"
                );
                true
            }
            Err(StoreError::FileError(_)) => {
                tracing::info!(path = %self.path.display(), "No fundamentalnode cache, starting empty");
                false
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), reason = %e, "Ignoring fundamentalnode cache");
                false
            }
        }
    }

    /// Persist the registry. An existing file of unknown format is left for
    /// the operator to fix and nothing is written.
    pub fn dump(&self, registry: &Registry) -> bool {
        match self.read() {
            Ok(_) | Err(StoreError::FileError(_)) | Err(StoreError::IncorrectFormat(_)) => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    reason = %e,
                    "Cache file format is unknown or invalid, please fix it manually"
                );
                return false;
            }
        }
        let snapshot = registry.snapshot();
        match self.write(&snapshot) {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), nodes = snapshot.nodes.len(), "Wrote fundamentalnode cache");
                true
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), reason = %e, "Failed to write fundamentalnode cache");
                false
            }
        }
    }
}
