//! Veil client runtime.
//!
//! [`ClientTunnelSession`] brings a tunnel up from a stored
//! [`ClientSessionConfig`], redirects traffic through it and puts the routing
//! table back exactly as it found it on the way down.

pub mod probe;
pub mod profile;
pub mod routing;
pub mod session;

pub use probe::{PingProber, Prober};
pub use profile::{ClientSessionConfig, ProfileError};
pub use routing::{LinuxRoutingTable, RouteOutcome, RouteSpec, RoutingError, RoutingTable};
pub use session::{ClientTunnelSession, SessionError, SessionSettings, SessionState, SessionStatus};
