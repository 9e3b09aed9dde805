use super::{BackendConfig, BackendError, BackendResult, PeerSpec, TransferStats, TunnelBackend};
use crate::engine::{EngineDevice, EngineError, TunnelEngine};
use crate::uapi::{DeviceDump, HexKey, UapiRequest};
use async_trait::async_trait;
use chrono::DateTime;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

#[derive(Default)]
struct BackendState {
    device: Option<Box<dyn EngineDevice>>,
    config: Option<BackendConfig>,
    peers: BTreeMap<String, PeerSpec>,
}

impl BackendState {
    fn device(&mut self) -> BackendResult<&mut Box<dyn EngineDevice>> {
        self.device.as_mut().ok_or(BackendError::DeviceMissing)
    }
}

/// [`TunnelBackend`] driving a userspace engine through its text protocol.
pub struct EngineBackend {
    engine: Arc<dyn TunnelEngine>,
    state: Mutex<BackendState>,
    running: AtomicBool,
}

impl EngineBackend {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(BackendState::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Interface name of the running device, if any.
    pub async fn interface_name(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.config.as_ref().map(|c| c.interface_name.clone())
    }

    async fn configure_started(state: &mut BackendState, config: &BackendConfig) -> BackendResult<()> {
        let private_key = HexKey::from_base64(&config.private_key).map_err(|source| {
            BackendError::InvalidKey {
                role: "private key",
                source,
            }
        })?;
        let request = UapiRequest::new()
            .private_key(&private_key)
            .listen_port(config.listen_port);

        let device = state.device()?;
        device.ipc_set(request.body()).await?;
        device.bring_up(&config.server_cidr).await?;
        Ok(())
    }

    /// Close the engine, containing any error or panic, then always remove
    /// the OS interface.
    async fn teardown(mut device: Box<dyn EngineDevice>) {
        let interface = device.interface().to_string();

        match AssertUnwindSafe(device.close()).catch_unwind().await {
            Ok(Ok(())) => debug!(interface = %interface, "engine closed"),
            Ok(Err(err)) => warn!(interface = %interface, "engine close failed: {err}"),
            Err(panic) => error!(
                interface = %interface,
                "engine panicked while closing: {}",
                panic_message(panic.as_ref())
            ),
        }

        if let Err(err) = device.remove_interface().await {
            warn!(interface = %interface, "failed to remove tunnel interface: {err}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl TunnelBackend for EngineBackend {
    #[instrument(skip(self, config), fields(interface = %config.interface_name, engine = %self.engine.name()))]
    async fn start(&self, config: &BackendConfig) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if state.device.is_some() {
            return Err(BackendError::AlreadyRunning);
        }

        // Reject a bad key before any process is launched
        HexKey::from_base64(&config.private_key).map_err(|source| BackendError::InvalidKey {
            role: "private key",
            source,
        })?;

        let device = self.engine.create_device(&config.interface_name).await?;
        // Configuration must go through the stored handle
        state.device = Some(device);

        if let Err(err) = Self::configure_started(&mut state, config).await {
            if let Some(device) = state.device.take() {
                Self::teardown(device).await;
            }
            return Err(err);
        }

        state.config = Some(config.clone());
        state.peers.clear();
        self.running.store(true, Ordering::SeqCst);
        info!(listen_port = config.listen_port, address = %config.server_cidr, "tunnel backend started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        let Some(device) = state.device.take() else {
            debug!("tunnel backend already stopped");
            return Ok(());
        };

        self.running.store(false, Ordering::SeqCst);
        state.config = None;
        state.peers.clear();
        Self::teardown(device).await;
        info!("tunnel backend stopped");
        Ok(())
    }

    async fn configure_peer(&self, peer: &PeerSpec) -> BackendResult<()> {
        let public_key =
            HexKey::from_base64(&peer.public_key).map_err(|source| BackendError::InvalidKey {
                role: "peer public key",
                source,
            })?;

        let mut state = self.state.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(BackendError::NotRunning);
        }

        let mut request = UapiRequest::new().public_key(&public_key);
        if let Some(endpoint) = peer.endpoint {
            request = request.endpoint(endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            request = request.persistent_keepalive(keepalive);
        }
        for allowed in &peer.allowed_addresses {
            request = request.allowed_ip(allowed);
        }

        state.device()?.ipc_set(request.body()).await?;
        state.peers.insert(peer.public_key.clone(), peer.clone());
        debug!(peer = %peer.public_key, allowed = ?peer.allowed_addresses, "peer configured");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> BackendResult<()> {
        let hex_key = HexKey::from_base64(public_key).map_err(|source| BackendError::InvalidKey {
            role: "peer public key",
            source,
        })?;

        let mut state = self.state.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(BackendError::NotRunning);
        }

        let request = UapiRequest::new().public_key(&hex_key).remove();
        state.device()?.ipc_set(request.body()).await?;
        state.peers.remove(public_key);
        debug!(peer = %public_key, "peer removed");
        Ok(())
    }

    async fn list_peers(&self) -> BackendResult<Vec<PeerSpec>> {
        let state = self.state.lock().await;
        Ok(state.peers.values().cloned().collect())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn transfer_stats(&self) -> BackendResult<TransferStats> {
        let mut state = self.state.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(BackendError::NotRunning);
        }

        let lines = state.device()?.ipc_get().await?;
        let dump = DeviceDump::parse(lines.iter().map(String::as_str)).map_err(EngineError::from)?;

        let mut stats = TransferStats::default();
        for peer in &dump.peers {
            stats.rx_bytes += peer.rx_bytes;
            stats.tx_bytes += peer.tx_bytes;
            if peer.last_handshake_sec > 0 {
                let seen = DateTime::from_timestamp(peer.last_handshake_sec, peer.last_handshake_nsec);
                stats.last_handshake = stats.last_handshake.max(seen);
            }
        }
        Ok(stats)
    }

    async fn abort(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.config = None;
        state.peers.clear();
        if let Some(device) = state.device.take() {
            // Dropping a process-backed device kills the engine
            warn!(interface = %device.interface(), "tunnel backend aborted");
        }
    }
}
