//! Tunnel backends for Veil.
//!
//! [`backend::TunnelBackend`] is the capability the control plane and the
//! client session program against. [`backend::EngineBackend`] implements it on
//! top of a userspace engine process driven through the text protocol in
//! [`uapi`].

pub mod backend;
pub mod engine;
pub mod uapi;

pub use backend::{
    BackendConfig, BackendError, BackendResult, EngineBackend, PeerSpec, TransferStats,
    TunnelBackend,
};
pub use engine::{EngineDevice, EngineError, ProcessEngine, TunnelEngine};
