//! Client tunnel session.
//!
//! A session borrows the stored [`ClientSessionConfig`] and owns everything it
//! creates on the way up: the tunnel interface (through the backend) and the
//! routes it installed. Going down removes exactly those routes, newest first,
//! and then stops the backend. Routes that were already present before
//! `connect` are never recorded and therefore never removed.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use shared_utils::config::{ClientConfig, RouteMode};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use veil_engine::{BackendConfig, BackendError, PeerSpec, TransferStats, TunnelBackend};

use crate::probe::Prober;
use crate::profile::{ClientSessionConfig, ProfileError};
use crate::routing::{RouteOutcome, RouteSpec, RoutingError, RoutingTable};

const HANDSHAKE_REMEDY: &str = "the server answers but the tunnel handshake did not complete; \
    allow outbound UDP to the server port in local firewalls, try another network if this one \
    uses restrictive NAT, and make sure the server still has this client registered";

const NETWORK_REMEDY: &str = "the server cannot be reached from this network; \
    check your internet connection and the server endpoint in the session profile";

/// The two halves of the IPv4 space; together they override the default
/// route without replacing it.
const HALF_ROUTES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tunnel is already connected")]
    AlreadyConnected,

    #[error("tunnel is not connected")]
    NotConnected,

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("tunnel backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("handshake with {server} did not complete: {remedy}")]
    HandshakeIncomplete { server: String, remedy: String },

    #[error("server {endpoint} is unreachable: {remedy}")]
    ServerUnreachable { endpoint: String, remedy: String },
}

impl From<ProfileError> for SessionError {
    fn from(err: ProfileError) -> Self {
        SessionError::InvalidConfig(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Runtime knobs of a session, usually taken from the `[client]` config section.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interface_name: String,
    pub keepalive: u16,
    pub route_mode: RouteMode,
    pub tunnel_network: Ipv4Net,
    pub probe_timeout: Duration,
    pub tunnel_probe_timeout: Duration,
    pub handshake_grace: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ClientConfig) -> SessionResult<Self> {
        let tunnel_network = config.tunnel_network.parse::<Ipv4Net>().map_err(|err| {
            SessionError::InvalidConfig(format!(
                "tunnel network {:?}: {err}",
                config.tunnel_network
            ))
        })?;
        Ok(SessionSettings {
            interface_name: config.interface_name.clone(),
            keepalive: config.keepalive_secs,
            route_mode: config.route_mode,
            tunnel_network: tunnel_network.trunc(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            tunnel_probe_timeout: Duration::from_secs(config.tunnel_probe_timeout_secs),
            handshake_grace: Duration::from_secs(config.handshake_grace_secs),
        })
    }
}

/// Snapshot returned by [`ClientTunnelSession::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub server_endpoint: String,
    pub assigned_address: String,
    pub registered_at: DateTime<Utc>,
    pub connected_since: Option<DateTime<Utc>>,
    pub transfer: Option<TransferStats>,
}

pub struct ClientTunnelSession<'a> {
    profile: &'a ClientSessionConfig,
    settings: SessionSettings,
    backend: Box<dyn TunnelBackend>,
    routes: Box<dyn RoutingTable>,
    prober: Box<dyn Prober>,
    state: SessionState,
    /// Routes this session added, in installation order
    installed: Vec<RouteSpec>,
    backend_started: bool,
    connected_since: Option<DateTime<Utc>>,
}

impl<'a> ClientTunnelSession<'a> {
    pub fn new(
        profile: &'a ClientSessionConfig,
        settings: SessionSettings,
        backend: Box<dyn TunnelBackend>,
        routes: Box<dyn RoutingTable>,
        prober: Box<dyn Prober>,
    ) -> Self {
        ClientTunnelSession {
            profile,
            settings,
            backend,
            routes,
            prober,
            state: SessionState::Disconnected,
            installed: Vec::new(),
            backend_started: false,
            connected_since: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn profile(&self) -> &ClientSessionConfig {
        self.profile
    }

    /// Routes currently owned by this session, oldest first.
    pub fn installed_routes(&self) -> &[RouteSpec] {
        &self.installed
    }

    /// Bring the tunnel up and verify it carries traffic.
    ///
    /// Any failure undoes the steps already taken and leaves the session
    /// `Disconnected`.
    #[instrument(level = "info", skip(self), fields(interface = %self.settings.interface_name))]
    pub async fn connect(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Connected {
            return Err(SessionError::AlreadyConnected);
        }

        self.state = SessionState::Connecting;
        match self.establish().await {
            Ok(()) => {
                self.state = SessionState::Connected;
                self.connected_since = Some(Utc::now());
                info!(
                    endpoint = %self.profile.server_endpoint,
                    address = %self.profile.assigned_address,
                    routes = self.installed.len(),
                    "tunnel connected"
                );
                Ok(())
            }
            Err(err) => {
                error!("connect failed: {err}");
                self.unwind().await;
                self.state = SessionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Reverse routes, then stop the backend. Failures along the way are
    /// logged and do not stop the teardown.
    #[instrument(level = "info", skip(self), fields(interface = %self.settings.interface_name))]
    pub async fn disconnect(&mut self) -> SessionResult<()> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }

        self.state = SessionState::Disconnecting;
        self.unwind().await;
        self.state = SessionState::Disconnected;
        self.connected_since = None;
        info!("tunnel disconnected");
        Ok(())
    }

    /// Current state plus, when connected, best-effort transfer counters.
    /// Never touches the network.
    pub async fn status(&self) -> SessionStatus {
        let transfer = if self.is_connected() {
            match self.backend.transfer_stats().await {
                Ok(stats) => Some(stats),
                Err(err) => {
                    debug!("transfer counters unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        SessionStatus {
            state: self.state,
            server_endpoint: self.profile.server_endpoint.clone(),
            assigned_address: self.profile.assigned_address.clone(),
            registered_at: self.profile.registered_at,
            connected_since: self.connected_since,
            transfer,
        }
    }

    async fn establish(&mut self) -> SessionResult<()> {
        let address = self.profile.tunnel_address()?;
        let endpoint = self.resolve_endpoint().await?;
        debug!(%endpoint, %address, "endpoint resolved");

        let config = BackendConfig {
            interface_name: self.settings.interface_name.clone(),
            private_key: self.profile.client_private_key.clone(),
            listen_port: 0,
            server_cidr: address.to_string(),
        };
        self.backend.start(&config).await?;
        self.backend_started = true;

        let server = PeerSpec::new(
            self.profile.server_public_key.as_str(),
            &["0.0.0.0/0".to_string()],
        )
        .with_endpoint(endpoint)
        .with_keepalive(self.settings.keepalive);
        self.backend.configure_peer(&server).await?;

        self.install_routes(endpoint).await?;

        tokio::time::sleep(self.settings.handshake_grace).await;
        self.verify(endpoint).await
    }

    async fn resolve_endpoint(&self) -> SessionResult<SocketAddr> {
        let target = self.profile.endpoint_target()?;
        let unreachable = || SessionError::ServerUnreachable {
            endpoint: target.clone(),
            remedy: NETWORK_REMEDY.to_string(),
        };

        let mut candidates = match tokio::net::lookup_host(target.as_str()).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(err) => {
                warn!(endpoint = %target, "cannot resolve server endpoint: {err}");
                return Err(unreachable());
            }
        };
        // Routes are IPv4 only, so prefer an IPv4 address when both exist
        candidates.sort_by_key(|addr| !addr.is_ipv4());
        candidates.into_iter().next().ok_or_else(unreachable)
    }

    fn planned_routes(&self) -> SessionResult<Vec<RouteSpec>> {
        let device = &self.settings.interface_name;
        match self.settings.route_mode {
            RouteMode::Subnet => Ok(vec![RouteSpec::through(
                self.settings.tunnel_network,
                device.as_str(),
            )]),
            RouteMode::Full => HALF_ROUTES
                .iter()
                .map(|half| {
                    half.parse::<Ipv4Net>()
                        .map(|net| RouteSpec::through(net, device.as_str()))
                        .map_err(|err| SessionError::InvalidConfig(err.to_string()))
                })
                .collect(),
        }
    }

    async fn install_routes(&mut self, endpoint: SocketAddr) -> SessionResult<()> {
        let mut plan = Vec::new();

        if self.settings.route_mode == RouteMode::Full {
            match endpoint.ip() {
                IpAddr::V4(server) if !server.is_loopback() => {
                    // Keep the encrypted traffic itself on the old default route
                    let current = self.routes.default_route().await?;
                    let mut host = RouteSpec::through(Ipv4Net::from(server), current.device);
                    if let Some(gateway) = current.gateway {
                        host = host.with_gateway(gateway);
                    }
                    plan.push(host);
                }
                IpAddr::V4(_) => debug!("loopback endpoint; no host route needed"),
                IpAddr::V6(_) => warn!(%endpoint, "IPv6 endpoint; host route skipped"),
            }
        }
        plan.extend(self.planned_routes()?);

        for route in plan {
            match self.routes.add_route(&route).await? {
                RouteOutcome::Installed => self.installed.push(route),
                RouteOutcome::AlreadyPresent => {
                    debug!(route = %route, "pre-existing route not recorded")
                }
            }
        }
        Ok(())
    }

    async fn verify(&self, endpoint: SocketAddr) -> SessionResult<()> {
        let tunnel_peer = IpAddr::V4(self.profile.server_tunnel_address);
        if self
            .prober
            .probe(tunnel_peer, self.settings.tunnel_probe_timeout)
            .await
        {
            info!(peer = %tunnel_peer, "server answers through the tunnel");
            return Ok(());
        }

        let server_ip = endpoint.ip();
        let reachable = server_ip.is_loopback()
            || self
                .prober
                .probe(server_ip, self.settings.probe_timeout)
                .await;

        if reachable {
            warn!(peer = %tunnel_peer, %endpoint, "endpoint reachable but tunnel silent");
            Err(SessionError::HandshakeIncomplete {
                server: endpoint.to_string(),
                remedy: HANDSHAKE_REMEDY.to_string(),
            })
        } else {
            warn!(%endpoint, "endpoint unreachable");
            Err(SessionError::ServerUnreachable {
                endpoint: endpoint.to_string(),
                remedy: NETWORK_REMEDY.to_string(),
            })
        }
    }

    async fn unwind(&mut self) {
        while let Some(route) = self.installed.pop() {
            if let Err(err) = self.routes.remove_route(&route).await {
                warn!(route = %route, "failed to remove route: {err}");
            }
        }

        if self.backend_started {
            if let Err(err) = self.backend.stop().await {
                warn!("backend did not stop cleanly: {err}");
                self.backend.abort().await;
            }
            self.backend_started = false;
        }
    }
}
