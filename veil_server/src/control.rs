//! Server lifecycle and client membership.
//!
//! The control plane owns one tunnel backend, the peer registry and the
//! address allocator. `start` and `stop` take the write side of the state
//! lock; every peer operation takes the read side so registrations proceed
//! concurrently while the lifecycle stays exclusive.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared_utils::config::ServerConfig;
use shared_utils::keys::KeyProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use veil_engine::{BackendConfig, TunnelBackend};

use crate::error::{Error, Result};
use crate::ipam::{parse_host, AddressAllocator};
use crate::registry::{PeerRecord, PeerRegistry, RegistryError};

/// What a client needs to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub public_key: String,
    /// `:<listen_port>`; the caller supplies the public host
    pub endpoint: String,
    pub server_address: String,
}

/// Result of a successful [`ControlPlane::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub assigned_address: String,
    pub registered_at: DateTime<Utc>,
    pub server: ServerInfo,
}

struct Running {
    config: BackendConfig,
    public_key: String,
    started_at: DateTime<Utc>,
}

impl Running {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            public_key: self.public_key.clone(),
            endpoint: format!(":{}", self.config.listen_port),
            server_address: self.config.server_cidr.clone(),
        }
    }
}

/// Build the backend settings for the server interface.
pub fn backend_config(server: &ServerConfig) -> Result<BackendConfig> {
    let private_key = server
        .private_key
        .clone()
        .ok_or_else(|| Error::InvalidConfig("server private key is not set".to_string()))?;
    Ok(BackendConfig {
        interface_name: server.interface_name.clone(),
        private_key,
        listen_port: server.listen_port,
        server_cidr: server.server_address.clone(),
    })
}

pub struct ControlPlane {
    backend: Arc<dyn TunnelBackend>,
    registry: Arc<PeerRegistry>,
    allocator: AddressAllocator,
    keys: Arc<dyn KeyProvider>,
    state: RwLock<Option<Running>>,
}

impl ControlPlane {
    pub fn new(
        backend: Arc<dyn TunnelBackend>,
        registry: Arc<PeerRegistry>,
        allocator: AddressAllocator,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            backend,
            registry,
            allocator,
            keys,
            state: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Configuration of the running instance.
    pub async fn config(&self) -> Option<BackendConfig> {
        self.state.read().await.as_ref().map(|r| r.config.clone())
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.as_ref().map(|r| r.started_at)
    }

    /// Check the configuration and return the derived server public key.
    fn validate(&self, config: &BackendConfig) -> Result<String> {
        if config.interface_name.trim().is_empty() {
            return Err(Error::InvalidConfig("interface name cannot be empty".to_string()));
        }
        if config.listen_port == 0 {
            return Err(Error::InvalidConfig(
                "listen port must be between 1 and 65535".to_string(),
            ));
        }
        if config.server_cidr.trim().is_empty() {
            return Err(Error::InvalidConfig("server address cannot be empty".to_string()));
        }
        self.keys
            .public_key(&config.private_key)
            .map_err(|e| Error::InvalidConfig(format!("server private key: {e}")))
    }

    /// Start the backend and restore every registered peer into it.
    #[instrument(skip(self, config), fields(interface = %config.interface_name))]
    pub async fn start(&self, config: BackendConfig) -> Result<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let public_key = self.validate(&config)?;
        self.backend.start(&config).await?;

        let (restored, skipped) = self.replay_registry().await;
        info!(
            listen_port = config.listen_port,
            address = %config.server_cidr,
            restored,
            skipped,
            "control plane running"
        );

        *state = Some(Running {
            config,
            public_key,
            started_at: Utc::now(),
        });
        Ok(())
    }

    async fn replay_registry(&self) -> (usize, usize) {
        let mut restored = 0;
        let mut skipped = 0;
        for (public_key, record) in self.registry.list().await {
            let allowed = std::slice::from_ref(&record.allowed_address);
            match self.backend.add_peer(&public_key, allowed).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(peer = %public_key, "failed to restore persisted peer: {err}");
                    skipped += 1;
                }
            }
        }
        (restored, skipped)
    }

    /// Stop the backend, forcing release once `deadline` passes. Always ends stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self, deadline: Duration) {
        let mut state = self.state.write().await;
        if state.take().is_none() {
            debug!("control plane already stopped");
            return;
        }

        match timeout(deadline, self.backend.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("tunnel backend stop failed: {err}");
                self.backend.abort().await;
            }
            Err(_) => {
                warn!("tunnel backend did not stop within the deadline, forcing release");
                self.backend.abort().await;
            }
        }
        info!("control plane stopped");
    }

    /// Add a client peer with `address` as its only allowed `/32`.
    pub async fn add_client(&self, public_key: &str, address: &str) -> Result<String> {
        let state = self.state.read().await;
        if state.is_none() {
            return Err(Error::NotRunning);
        }
        self.add_client_running(public_key, address).await
    }

    async fn add_client_running(&self, public_key: &str, address: &str) -> Result<String> {
        self.keys.validate(public_key)?;
        let host = parse_host(address).ok_or_else(|| {
            Error::InvalidConfig(format!("client address {address:?} is not an IPv4 address"))
        })?;
        let allowed = format!("{host}/32");

        if let Ok(existing) = self.registry.get(public_key).await {
            if existing.allowed_address != allowed {
                return Err(Error::AlreadyRegistered {
                    public_key: public_key.to_string(),
                    existing: existing.allowed_address,
                });
            }
        }

        self.backend
            .add_peer(public_key, std::slice::from_ref(&allowed))
            .await?;

        match self.registry.add(public_key, &allowed).await {
            Ok(_) => {}
            Err(RegistryError::Conflict { existing, .. }) => {
                // Another caller registered this key while the backend call was in flight
                self.restore_peer(public_key, &existing).await;
                return Err(Error::AlreadyRegistered {
                    public_key: public_key.to_string(),
                    existing,
                });
            }
            // The peer is live; a persistence failure only costs it on restart
            Err(err) => error!(peer = %public_key, "client added but not persisted: {err}"),
        }

        info!(peer = %public_key, address = %allowed, "client added");
        Ok(allowed)
    }

    /// Put the backend peer back to the single address the registry holds.
    async fn restore_peer(&self, public_key: &str, address: &str) {
        if let Err(err) = self.backend.remove_peer(public_key).await {
            warn!(peer = %public_key, "failed to drop conflicting peer entry: {err}");
        }
        if let Err(err) = self
            .backend
            .add_peer(public_key, &[address.to_string()])
            .await
        {
            error!(peer = %public_key, address, "failed to restore registered peer: {err}");
        }
    }

    pub async fn remove_client(&self, public_key: &str) -> Result<()> {
        let state = self.state.read().await;
        if state.is_none() {
            return Err(Error::NotRunning);
        }

        self.backend.remove_peer(public_key).await?;

        let record = self.registry.get(public_key).await.ok();
        if let Err(err) = self.registry.remove(public_key).await {
            error!(peer = %public_key, "client removed but registry not updated: {err}");
        }
        if let Some(addr) = record.and_then(|r| parse_host(&r.allowed_address)) {
            self.allocator.release(addr).await;
        }

        info!(peer = %public_key, "client removed");
        Ok(())
    }

    /// Register a client key, allocating an address unless it already has one.
    pub async fn register(&self, public_key: &str) -> Result<Registration> {
        let state = self.state.read().await;
        let running = state.as_ref().ok_or(Error::NotRunning)?;
        self.keys.validate(public_key)?;

        if let Ok(existing) = self.registry.get(public_key).await {
            debug!(peer = %public_key, address = %existing.allowed_address, "client already registered");
            self.backend
                .add_peer(public_key, std::slice::from_ref(&existing.allowed_address))
                .await?;
            return Ok(Registration {
                assigned_address: existing.allowed_address,
                registered_at: existing.registered_at,
                server: running.info(),
            });
        }

        let known = self.registry.addresses().await;
        let assigned = self
            .allocator
            .allocate(&known)
            .await
            .map_err(Error::PoolExhausted)?;

        match self.add_client_running(public_key, &assigned.to_string()).await {
            Ok(allowed) => {
                let registered_at = self
                    .registry
                    .get(public_key)
                    .await
                    .map(|r| r.registered_at)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Registration {
                    assigned_address: allowed,
                    registered_at,
                    server: running.info(),
                })
            }
            Err(err) => {
                self.allocator.release(assigned.addr()).await;
                Err(err)
            }
        }
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let state = self.state.read().await;
        state.as_ref().map(Running::info).ok_or(Error::NotRunning)
    }

    pub async fn list_clients(&self) -> Result<BTreeMap<String, PeerRecord>> {
        let state = self.state.read().await;
        if state.is_none() {
            return Err(Error::NotRunning);
        }
        Ok(self.registry.list().await)
    }
}
