//! Durable peer membership.
//!
//! The registry keeps every registered peer in memory and mirrors the full
//! mapping to a single JSON document on each mutation. The document is
//! replaced with a temp-file-and-rename so a crash leaves either the previous
//! or the new snapshot on disk, never a mix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_utils::persist::{discard_stale_temp, write_atomic};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("peer {0} is not registered")]
    NotFound(String),

    #[error("peer {public_key} is already registered with {existing}")]
    Conflict { public_key: String, existing: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// One registered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub public_key: String,
    /// Address in CIDR form, normally a `/32`
    #[serde(rename = "allowedIPs")]
    pub allowed_address: String,
    pub registered_at: DateTime<Utc>,
}

pub struct PeerRegistry {
    path: PathBuf,
    peers: RwLock<BTreeMap<String, PeerRecord>>,
}

impl PeerRegistry {
    /// Open the registry stored at `path`.
    ///
    /// A missing or empty file yields an empty registry. A file that exists but
    /// does not parse is an error; it is never silently replaced.
    pub async fn open(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        discard_stale_temp(&path).await;

        let peers = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        info!(file = %path.display(), peers = peers.len(), "peer registry loaded");
        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &BTreeMap<String, PeerRecord>) -> RegistryResult<()> {
        let serialized = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &serialized)
            .await
            .map_err(|source| RegistryError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Register a peer. Re-adding the same key with the same address returns
    /// the existing record unchanged.
    pub async fn add(&self, public_key: &str, allowed_address: &str) -> RegistryResult<PeerRecord> {
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(public_key) {
            if existing.allowed_address == allowed_address {
                return Ok(existing.clone());
            }
            return Err(RegistryError::Conflict {
                public_key: public_key.to_string(),
                existing: existing.allowed_address.clone(),
            });
        }

        let record = PeerRecord {
            public_key: public_key.to_string(),
            allowed_address: allowed_address.to_string(),
            registered_at: Utc::now(),
        };

        // Memory only changes once the new snapshot is on disk
        let mut next = peers.clone();
        next.insert(public_key.to_string(), record.clone());
        self.persist(&next).await?;
        *peers = next;

        debug!(peer = %public_key, address = %allowed_address, "peer persisted");
        Ok(record)
    }

    /// Remove a peer. Returns the removed record, or `None` if it was absent.
    pub async fn remove(&self, public_key: &str) -> RegistryResult<Option<PeerRecord>> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(public_key) {
            return Ok(None);
        }

        let mut next = peers.clone();
        let removed = next.remove(public_key);
        self.persist(&next).await?;
        *peers = next;

        debug!(peer = %public_key, "peer removed from registry");
        Ok(removed)
    }

    pub async fn get(&self, public_key: &str) -> RegistryResult<PeerRecord> {
        self.peers
            .read()
            .await
            .get(public_key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(public_key.to_string()))
    }

    pub async fn list(&self) -> BTreeMap<String, PeerRecord> {
        self.peers.read().await.clone()
    }

    /// Addresses of every registered peer.
    pub async fn addresses(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .values()
            .map(|record| record.allowed_address.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const PEER_A: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";
    const PEER_B: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    #[tokio::test]
    async fn missing_and_empty_files_open_empty() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).await.unwrap();
        assert_eq!(registry.count().await, 0);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, b"  \n").unwrap();
        let registry = PeerRegistry::open(&empty).await.unwrap();
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.json");
        std::fs::write(&path, b"{\"truncated\": ").unwrap();

        let err = PeerRegistry::open(&path).await.err().unwrap();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
        // The damaged file is left for inspection
        assert!(path.exists());
    }

    #[tokio::test]
    async fn add_get_remove() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).await.unwrap();

        let record = registry.add(PEER_A, "10.0.0.2/32").await.unwrap();
        assert_eq!(record.allowed_address, "10.0.0.2/32");
        assert_eq!(registry.get(PEER_A).await.unwrap(), record);
        assert!(matches!(
            registry.get(PEER_B).await,
            Err(RegistryError::NotFound(_))
        ));

        assert_eq!(registry.remove(PEER_A).await.unwrap(), Some(record));
        assert_eq!(registry.remove(PEER_A).await.unwrap(), None);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn re_adding_is_idempotent_but_address_changes_conflict() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers.json")).await.unwrap();

        let first = registry.add(PEER_A, "10.0.0.2/32").await.unwrap();
        let again = registry.add(PEER_A, "10.0.0.2/32").await.unwrap();
        assert_eq!(first.registered_at, again.registered_at);

        assert!(matches!(
            registry.add(PEER_A, "10.0.0.9/32").await,
            Err(RegistryError::Conflict { .. })
        ));
        assert_eq!(registry.get(PEER_A).await.unwrap().allowed_address, "10.0.0.2/32");
    }

    #[tokio::test]
    async fn document_format_and_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("peers.json");
        let registry = PeerRegistry::open(&path).await.unwrap();
        registry.add(PEER_A, "10.0.0.2/32").await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &doc[PEER_A];
        assert_eq!(entry["publicKey"], PEER_A);
        assert_eq!(entry["allowedIPs"], "10.0.0.2/32");
        assert!(entry["registeredAt"].as_str().unwrap().contains('T'));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        // A directory where the temp file should go makes every write fail
        let path = dir.path().join("peers.json");
        std::fs::create_dir(dir.path().join("peers.json.tmp")).unwrap();
        let registry = PeerRegistry {
            path,
            peers: RwLock::new(BTreeMap::new()),
        };

        assert!(matches!(
            registry.add(PEER_A, "10.0.0.2/32").await,
            Err(RegistryError::Io { .. })
        ));
        assert_eq!(registry.count().await, 0);
    }
}
