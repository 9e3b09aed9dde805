//! The client's session profile.
//!
//! Written once registration succeeds and read on every `connect`. The file
//! holds the client's private key, so it is always written atomically with
//! mode 0600. Whether a tunnel is up is never stored here.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use shared_utils::keys::KeyProvider;
use shared_utils::persist::write_atomic;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Host used when the server advertised its endpoint as a bare `:port`.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to access session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

pub type ProfileResult<T> = Result<T, ProfileError>;

fn default_server_tunnel_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

/// Everything the client needs to bring its tunnel up.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSessionConfig {
    pub client_private_key: String,
    pub client_public_key: String,
    pub server_public_key: String,
    /// `host:port`, or `:port` for a server on this machine
    pub server_endpoint: String,
    /// Tunnel address assigned by the server, in CIDR form
    #[serde(rename = "clientIP", alias = "assignedAddress")]
    pub assigned_address: String,
    #[serde(default = "default_server_tunnel_address")]
    pub server_tunnel_address: Ipv4Addr,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for ClientSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSessionConfig")
            .field("client_private_key", &"[REDACTED]")
            .field("client_public_key", &self.client_public_key)
            .field("server_public_key", &self.server_public_key)
            .field("server_endpoint", &self.server_endpoint)
            .field("assigned_address", &self.assigned_address)
            .field("server_tunnel_address", &self.server_tunnel_address)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

impl ClientSessionConfig {
    /// Read the profile at `path`. `None` means the client has not registered yet.
    pub async fn load(path: &Path) -> ProfileResult<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %path.display(), "no session profile");
                return Ok(None);
            }
            Err(source) => {
                return Err(ProfileError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ProfileError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    pub async fn save(&self, path: &Path) -> ProfileResult<()> {
        let serialized = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &serialized)
            .await
            .map_err(|source| ProfileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        info!(file = %path.display(), address = %self.assigned_address, "session profile saved");
        Ok(())
    }

    /// Remove the profile. Returns whether a file was actually deleted.
    pub async fn delete(path: &Path) -> ProfileResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ProfileError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Check keys, endpoint and address before anything touches the system.
    pub fn validate(&self, keys: &dyn KeyProvider) -> ProfileResult<()> {
        let derived = keys
            .public_key(&self.client_private_key)
            .map_err(|err| invalid("client private key", err))?;
        keys.validate(&self.client_public_key)
            .map_err(|err| invalid("client public key", err))?;
        if derived != self.client_public_key {
            return Err(invalid(
                "client public key",
                "does not match the client private key",
            ));
        }
        keys.validate(&self.server_public_key)
            .map_err(|err| invalid("server public key", err))?;

        self.endpoint_parts()?;
        self.tunnel_address()?;
        Ok(())
    }

    /// Endpoint with an explicit host, ready for name resolution.
    pub fn endpoint_target(&self) -> ProfileResult<String> {
        let (host, port) = self.endpoint_parts()?;
        if host.contains(':') {
            return Ok(format!("[{host}]:{port}"));
        }
        Ok(format!("{host}:{port}"))
    }

    /// Host part of the endpoint, with `:port` mapped to the loopback host.
    pub fn endpoint_host(&self) -> ProfileResult<&str> {
        self.endpoint_parts().map(|(host, _)| host)
    }

    fn endpoint_parts(&self) -> ProfileResult<(&str, u16)> {
        let (host, port) = self
            .server_endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid("server endpoint", "expected host:port"))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| invalid("server endpoint", format!("bad port {port:?}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { LOOPBACK_HOST } else { host };
        Ok((host, port))
    }

    /// The assigned address as a network. A bare address is taken as /32.
    pub fn tunnel_address(&self) -> ProfileResult<Ipv4Net> {
        if let Ok(net) = self.assigned_address.parse::<Ipv4Net>() {
            return Ok(net);
        }
        self.assigned_address
            .parse::<Ipv4Addr>()
            .map(Ipv4Net::from)
            .map_err(|_| {
                invalid(
                    "assigned address",
                    format!("{:?} is not an IPv4 address", self.assigned_address),
                )
            })
    }
}

fn invalid(field: &'static str, message: impl ToString) -> ProfileError {
    ProfileError::Invalid {
        field,
        message: message.to_string(),
    }
}
