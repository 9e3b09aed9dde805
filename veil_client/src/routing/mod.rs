//! Routing table access for the client session.
//!
//! The session only needs three things from the system routing table: the
//! current default route, adding a route and removing one. Everything else
//! (which routes to install, and undoing them) is decided by the session.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use shared_utils::command::CommandError;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

mod linux;
pub use linux::{parse_default_route, LinuxRoutingTable};

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no IPv4 default route is configured")]
    NoDefaultRoute,

    #[error("unexpected routing table output: {0}")]
    Parse(String),
}

/// One IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Net,
    pub via: Option<Ipv4Addr>,
    pub device: String,
}

impl RouteSpec {
    /// Route sending `destination` straight out of `device`.
    pub fn through(destination: Ipv4Net, device: impl Into<String>) -> Self {
        RouteSpec {
            destination,
            via: None,
            device: device.into(),
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.via = Some(gateway);
        self
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(via) = self.via {
            write!(f, " via {via}")?;
        }
        write!(f, " dev {}", self.device)
    }
}

/// The system's default route as it was before the tunnel came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<Ipv4Addr>,
    pub device: String,
}

/// What `add_route` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Installed,
    /// An identical route was already present; it is not ours to remove.
    AlreadyPresent,
}

/// Routing table trait
#[async_trait]
pub trait RoutingTable: Send + Sync {
    async fn default_route(&self) -> RoutingResult<DefaultRoute>;

    async fn add_route(&self, route: &RouteSpec) -> RoutingResult<RouteOutcome>;

    /// Remove a route. A route that is already gone is not an error.
    async fn remove_route(&self, route: &RouteSpec) -> RoutingResult<()>;
}

/// Routing table of the machine we run on.
pub fn system_routing_table() -> Box<dyn RoutingTable> {
    Box::new(LinuxRoutingTable::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_rendering() {
        let host: Ipv4Net = "203.0.113.7/32".parse().unwrap();
        let route = RouteSpec::through(host, "eth0").with_gateway(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(route.to_string(), "203.0.113.7/32 via 192.168.1.1 dev eth0");

        let half: Ipv4Net = "0.0.0.0/1".parse().unwrap();
        assert_eq!(RouteSpec::through(half, "veil0").to_string(), "0.0.0.0/1 dev veil0");
    }
}
