use shared_utils::keys::KeyError;
use thiserror::Error;
use veil_engine::BackendError;

use crate::ipam::IpamError;
use crate::registry::RegistryError;

/// Errors returned by the [`ControlPlane`](crate::ControlPlane).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("control plane is not running")]
    NotRunning,

    #[error("control plane is already running")]
    AlreadyRunning,

    #[error("invalid public key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("peer {public_key} is already registered with {existing}")]
    AlreadyRegistered { public_key: String, existing: String },

    #[error(transparent)]
    PoolExhausted(IpamError),

    #[error("tunnel backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("peer registry error: {0}")]
    Persistence(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, Error>;
