//! Backend abstraction over tunnel implementations.
//!
//! The control plane and the client session only ever hold a
//! `dyn TunnelBackend`, so a kernel-backed or higher-throughput engine can be
//! added later as another implementation without touching callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_utils::keys::KeyError;
use std::net::SocketAddr;
use thiserror::Error;

use crate::engine::EngineError;

mod engine_backend;
pub use engine_backend::EngineBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend is already running")]
    AlreadyRunning,

    #[error("backend is not running")]
    NotRunning,

    #[error("invalid {role}: {source}")]
    InvalidKey {
        role: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("engine device handle is missing")]
    DeviceMissing,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Interface-level settings applied when the backend starts.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub interface_name: String,
    /// Base64 private key
    pub private_key: String,
    /// 0 lets the engine pick a port
    pub listen_port: u16,
    /// Address assigned to the interface, in CIDR form
    pub server_cidr: String,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("interface_name", &self.interface_name)
            .field("private_key", &"[REDACTED]")
            .field("listen_port", &self.listen_port)
            .field("server_cidr", &self.server_cidr)
            .finish()
    }
}

/// Full description of a peer to configure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Base64 public key
    pub public_key: String,
    pub allowed_addresses: Vec<String>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
}

impl PeerSpec {
    pub fn new(public_key: impl Into<String>, allowed_addresses: &[String]) -> Self {
        PeerSpec {
            public_key: public_key.into(),
            allowed_addresses: allowed_addresses.to_vec(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }
}

/// Byte counters summed over all peers of the running device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<DateTime<Utc>>,
}

/// Capability implemented by every tunnel backend.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Create the interface and apply the interface-level configuration.
    async fn start(&self, config: &BackendConfig) -> BackendResult<()>;

    /// Tear down the device and interface. Stopping a stopped backend is a no-op.
    async fn stop(&self) -> BackendResult<()>;

    /// Add (or extend) a peer with only allowed addresses.
    async fn add_peer(&self, public_key: &str, allowed_addresses: &[String]) -> BackendResult<()> {
        self.configure_peer(&PeerSpec::new(public_key, allowed_addresses))
            .await
    }

    /// Add a peer with endpoint and keepalive settings.
    async fn configure_peer(&self, peer: &PeerSpec) -> BackendResult<()>;

    async fn remove_peer(&self, public_key: &str) -> BackendResult<()>;

    /// Peers configured through this backend, as tracked locally.
    async fn list_peers(&self) -> BackendResult<Vec<PeerSpec>>;

    fn is_running(&self) -> bool;

    async fn transfer_stats(&self) -> BackendResult<TransferStats>;

    /// Drop every resource without waiting on the engine. Used once a
    /// graceful [`TunnelBackend::stop`] has exceeded its deadline.
    async fn abort(&self);
}
