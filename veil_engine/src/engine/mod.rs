//! Tunnel engine driver.
//!
//! A [`TunnelEngine`] creates one [`EngineDevice`] per interface. The device
//! accepts text configuration requests (see [`crate::uapi`]) and owns the
//! OS-level interface while it lives.

use async_trait::async_trait;
use shared_utils::command::CommandError;
use thiserror::Error;

use crate::uapi::UapiError;

mod process;
pub use process::{EngineSettings, ProcessEngine};

/// Errors surfaced by the engine driver.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Uapi(#[from] UapiError),

    #[error("engine failed to start: {0}")]
    Startup(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A running engine instance bound to one interface.
#[async_trait]
pub trait EngineDevice: Send {
    fn interface(&self) -> &str;

    /// Apply a `set=1` request body.
    async fn ipc_set(&mut self, body: &str) -> EngineResult<()>;

    /// Fetch the `get=1` dump as `key=value` lines.
    async fn ipc_get(&mut self) -> EngineResult<Vec<String>>;

    /// Assign `address` (CIDR) to the interface and bring the link up.
    async fn bring_up(&mut self, address: &str) -> EngineResult<()>;

    /// Shut the engine down.
    async fn close(&mut self) -> EngineResult<()>;

    /// Delete the OS interface if it still exists. Missing interfaces are success.
    async fn remove_interface(&mut self) -> EngineResult<()>;
}

/// Factory for engine devices.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Human readable engine name for logs.
    fn name(&self) -> &str;

    async fn create_device(&self, interface: &str) -> EngineResult<Box<dyn EngineDevice>>;
}
