//! Veil server control plane.
//!
//! Ties the address allocator, the durable peer registry and a tunnel backend
//! together behind [`ControlPlane`].

pub mod control;
pub mod error;
pub mod ipam;
pub mod registry;

pub use control::{backend_config, ControlPlane, Registration, ServerInfo};
pub use error::{Error, Result};
pub use ipam::{AddressAllocator, AddressPool, IpamError};
pub use registry::{PeerRecord, PeerRegistry, RegistryError};
