//! Configuration management for Veil.
//!
//! Both the server daemon and the client runtime read a single TOML file.
//! Values missing from the file fall back to defaults, and any `VEIL_*`
//! environment variable overrides the file before validation runs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Role of the Veil instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Client role
    #[default]
    Client,
    /// Server role
    Server,
}

/// Server (control plane) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name of the tunnel interface (default: "wg0")
    #[serde(default = "default_server_interface")]
    pub interface_name: String,

    /// Base64 server private key
    pub private_key: Option<String>,

    /// UDP port the engine listens on (default: 51820)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Server tunnel address in CIDR form (default: "10.0.0.1/24")
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Directory holding `peers.json`
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Deadline for a graceful stop, in seconds (default: 10)
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_server_interface() -> String {
    "wg0".to_string()
}

fn default_listen_port() -> u16 {
    51820
}

fn default_server_address() -> String {
    "10.0.0.1/24".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/veil".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            interface_name: default_server_interface(),
            private_key: None,
            listen_port: default_listen_port(),
            server_address: default_server_address(),
            data_dir: default_data_dir(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Returns the stop deadline as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Location of the peer registry file inside `data_dir`.
    pub fn registry_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("peers.json")
    }
}

/// How the address allocator searches for a free address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Rescan the whole range on every allocation
    Linear,
    /// Keep a low-water cursor between allocations
    #[default]
    Tracked,
}

/// Address pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpamConfig {
    /// Client address range (default: "10.0.0.0/24")
    #[serde(default = "default_ipam_cidr")]
    pub cidr: String,

    /// Gateway address excluded from allocation (default: "10.0.0.1")
    #[serde(default = "default_ipam_gateway")]
    pub gateway: String,

    #[serde(default)]
    pub strategy: AllocationStrategy,
}

fn default_ipam_cidr() -> String {
    "10.0.0.0/24".to_string()
}

fn default_ipam_gateway() -> String {
    "10.0.0.1".to_string()
}

impl Default for IpamConfig {
    fn default() -> Self {
        IpamConfig {
            cidr: default_ipam_cidr(),
            gateway: default_ipam_gateway(),
            strategy: AllocationStrategy::default(),
        }
    }
}

/// Userspace tunnel engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Engine executable (default: "wireguard-go")
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Arguments placed before the interface name (default: ["-f"])
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    /// Directory where the engine creates `<interface>.sock`
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// How long to wait for the control socket to appear, in milliseconds
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

fn default_engine_command() -> String {
    "wireguard-go".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec!["-f".to_string()]
}

fn default_socket_dir() -> String {
    "/var/run/wireguard".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            command: default_engine_command(),
            args: default_engine_args(),
            socket_dir: default_socket_dir(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Which destinations the client sends through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// All IPv4 traffic (0.0.0.0/1 + 128.0.0.0/1)
    #[default]
    Full,
    /// Only the tunnel network
    Subnet,
}

/// Client runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Name of the local tunnel interface (default: "veil0")
    #[serde(default = "default_client_interface")]
    pub interface_name: String,

    /// Session profile path; `~/.veil/session.json` when unset
    #[serde(default)]
    pub session_file: Option<String>,

    /// Persistent keepalive towards the server, in seconds (default: 25)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,

    #[serde(default)]
    pub route_mode: RouteMode,

    /// Network routed in `subnet` mode (default: "10.0.0.0/24")
    #[serde(default = "default_tunnel_network")]
    pub tunnel_network: String,

    /// Timeout of the coarse reachability probe, in seconds (default: 3)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Timeout of the probe through the tunnel, in seconds (default: 5)
    #[serde(default = "default_tunnel_probe_timeout_secs")]
    pub tunnel_probe_timeout_secs: u64,

    /// Wait before probing the tunnel, in seconds (default: 3)
    #[serde(default = "default_handshake_grace_secs")]
    pub handshake_grace_secs: u64,
}

fn default_client_interface() -> String {
    "veil0".to_string()
}

fn default_keepalive_secs() -> u16 {
    25
}

fn default_tunnel_network() -> String {
    "10.0.0.0/24".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_tunnel_probe_timeout_secs() -> u64 {
    5
}

fn default_handshake_grace_secs() -> u64 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            interface_name: default_client_interface(),
            session_file: None,
            keepalive_secs: default_keepalive_secs(),
            route_mode: RouteMode::default(),
            tunnel_network: default_tunnel_network(),
            probe_timeout_secs: default_probe_timeout_secs(),
            tunnel_probe_timeout_secs: default_tunnel_probe_timeout_secs(),
            handshake_grace_secs: default_handshake_grace_secs(),
        }
    }
}

impl ClientConfig {
    /// Resolved session profile path.
    pub fn session_path(&self) -> PathBuf {
        match &self.session_file {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".veil")
                .join("session.json"),
        }
    }
}

/// Main configuration structure for Veil.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub role: Role,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ipam: IpamConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::default(),
            log_level: default_log_level(),
            server: ServerConfig::default(),
            ipam: IpamConfig::default(),
            engine: EngineConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, apply `VEIL_*` overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Environment takes precedence over the file
        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults (still
    /// subject to `VEIL_*` overrides and validation).
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound(_)) => {
                let mut config = Config::default();
                Self::apply_env_overrides(&mut config);
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration for its role.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            Role::Server => {
                if self.server.interface_name.trim().is_empty() {
                    return Err(invalid("server.interface_name", "cannot be empty"));
                }
                if self.server.private_key.is_none() {
                    return Err(ConfigError::MissingValue("server.private_key".to_string()));
                }
                if self.server.listen_port == 0 {
                    return Err(invalid("server.listen_port", "must be between 1 and 65535"));
                }
                if self.server.server_address.trim().is_empty() {
                    return Err(invalid("server.server_address", "cannot be empty"));
                }
                if !self.ipam.cidr.contains('/') {
                    return Err(invalid("ipam.cidr", "expected CIDR notation"));
                }
                if self.ipam.gateway.trim().is_empty() {
                    return Err(invalid("ipam.gateway", "cannot be empty"));
                }
            }
            Role::Client => {
                if self.client.interface_name.trim().is_empty() {
                    return Err(invalid("client.interface_name", "cannot be empty"));
                }
                if self.client.probe_timeout_secs == 0 || self.client.tunnel_probe_timeout_secs == 0
                {
                    return Err(invalid("client.probe_timeout_secs", "must be greater than 0"));
                }
            }
        }

        if self.engine.command.trim().is_empty() {
            return Err(invalid("engine.command", "cannot be empty"));
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: VEIL_)
    /// Example keys:
    /// - VEIL_ROLE, VEIL_LOG_LEVEL
    /// - VEIL_SERVER_INTERFACE_NAME, VEIL_SERVER_PRIVATE_KEY, VEIL_SERVER_LISTEN_PORT,
    ///   VEIL_SERVER_ADDRESS, VEIL_SERVER_DATA_DIR, VEIL_SERVER_STOP_TIMEOUT_SECS
    /// - VEIL_IPAM_CIDR, VEIL_IPAM_GATEWAY, VEIL_IPAM_STRATEGY
    /// - VEIL_ENGINE_COMMAND, VEIL_ENGINE_ARGS, VEIL_ENGINE_SOCKET_DIR
    /// - VEIL_CLIENT_INTERFACE_NAME, VEIL_CLIENT_SESSION_FILE, VEIL_CLIENT_ROUTE_MODE,
    ///   VEIL_CLIENT_KEEPALIVE_SECS
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn non_empty(key: &str) -> Option<String> {
            env::var(key).ok().filter(|v| !v.trim().is_empty())
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }

        // Top-level
        if let Some(v) = non_empty("VEIL_ROLE") {
            cfg.role = match v.to_ascii_lowercase().as_str() {
                "server" => Role::Server,
                _ => Role::Client,
            };
        }
        if let Some(v) = non_empty("VEIL_LOG_LEVEL") {
            cfg.log_level = v;
        }

        // Server
        if let Some(v) = non_empty("VEIL_SERVER_INTERFACE_NAME") {
            cfg.server.interface_name = v;
        }
        if let Some(v) = non_empty("VEIL_SERVER_PRIVATE_KEY") {
            cfg.server.private_key = Some(v);
        }
        if let Some(n) = non_empty("VEIL_SERVER_LISTEN_PORT").and_then(|v| v.parse().ok()) {
            cfg.server.listen_port = n;
        }
        if let Some(v) = non_empty("VEIL_SERVER_ADDRESS") {
            cfg.server.server_address = v;
        }
        if let Some(v) = non_empty("VEIL_SERVER_DATA_DIR") {
            cfg.server.data_dir = v;
        }
        if let Some(n) = non_empty("VEIL_SERVER_STOP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            cfg.server.stop_timeout_secs = n;
        }

        // Address pool
        if let Some(v) = non_empty("VEIL_IPAM_CIDR") {
            cfg.ipam.cidr = v;
        }
        if let Some(v) = non_empty("VEIL_IPAM_GATEWAY") {
            cfg.ipam.gateway = v;
        }
        if let Some(v) = non_empty("VEIL_IPAM_STRATEGY") {
            cfg.ipam.strategy = match v.to_ascii_lowercase().as_str() {
                "linear" => AllocationStrategy::Linear,
                "tracked" => AllocationStrategy::Tracked,
                _ => cfg.ipam.strategy,
            };
        }

        // Engine
        if let Some(v) = non_empty("VEIL_ENGINE_COMMAND") {
            cfg.engine.command = v;
        }
        if let Ok(v) = env::var("VEIL_ENGINE_ARGS") {
            cfg.engine.args = split_csv(&v);
        }
        if let Some(v) = non_empty("VEIL_ENGINE_SOCKET_DIR") {
            cfg.engine.socket_dir = v;
        }

        // Client
        if let Some(v) = non_empty("VEIL_CLIENT_INTERFACE_NAME") {
            cfg.client.interface_name = v;
        }
        if let Some(v) = non_empty("VEIL_CLIENT_SESSION_FILE") {
            cfg.client.session_file = Some(v);
        }
        if let Some(v) = non_empty("VEIL_CLIENT_ROUTE_MODE") {
            cfg.client.route_mode = match v.to_ascii_lowercase().as_str() {
                "subnet" => RouteMode::Subnet,
                _ => RouteMode::Full,
            };
        }
        if let Some(n) = non_empty("VEIL_CLIENT_KEEPALIVE_SECS").and_then(|v| v.parse().ok()) {
            cfg.client.keepalive_secs = n;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("veil").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_KEY: &str = "YNqHbfBQKaGvzefSSLXYKoaaI9d6DvrULEgqRaD5mXo=";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.server.listen_port, 51820);
        assert_eq!(config.server.interface_name, "wg0");
        assert_eq!(config.ipam.cidr, "10.0.0.0/24");
        assert_eq!(config.ipam.gateway, "10.0.0.1");
        assert_eq!(config.ipam.strategy, AllocationStrategy::Tracked);
        assert_eq!(config.client.route_mode, RouteMode::Full);
        assert_eq!(config.client.keepalive_secs, 25);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = format!(
            r#"
            role = "server"
            log_level = "debug"

            [server]
            interface_name = "wg7"
            private_key = "{TEST_KEY}"
            listen_port = 51999
            data_dir = "/tmp/veil-test"

            [ipam]
            cidr = "10.9.0.0/24"
            gateway = "10.9.0.1"
            strategy = "linear"

            [engine]
            command = "boringtun-cli"
            args = ["--foreground"]
            "#
        );

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.role, Role::Server);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.server.interface_name, "wg7");
        assert_eq!(config.server.private_key.as_deref(), Some(TEST_KEY));
        assert_eq!(config.server.listen_port, 51999);
        assert_eq!(
            config.server.registry_path(),
            PathBuf::from("/tmp/veil-test/peers.json")
        );
        assert_eq!(config.ipam.strategy, AllocationStrategy::Linear);
        assert_eq!(config.engine.command, "boringtun-cli");
        assert_eq!(config.engine.args, vec!["--foreground".to_string()]);
        // Unset values keep their defaults
        assert_eq!(config.server.stop_timeout_secs, 10);
        assert_eq!(config.server.server_address, "10.0.0.1/24");
    }

    #[test]
    fn test_save_config() {
        let config = Config {
            role: Role::Server,
            server: ServerConfig {
                private_key: Some(TEST_KEY.to_string()),
                listen_port: 4000,
                ..Default::default()
            },
            client: ClientConfig {
                route_mode: RouteMode::Subnet,
                ..Default::default()
            },
            ..Default::default()
        };

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.role, Role::Server);
        assert_eq!(loaded.server.listen_port, 4000);
        assert_eq!(loaded.client.route_mode, RouteMode::Subnet);
    }

    #[test]
    fn test_validation() {
        // Server without a private key
        let config = Config {
            role: Role::Server,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue(ref key)) if key == "server.private_key"
        ));

        // Server with port 0
        let config = Config {
            role: Role::Server,
            server: ServerConfig {
                private_key: Some(TEST_KEY.to_string()),
                listen_port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Valid server
        let config = Config {
            role: Role::Server,
            server: ServerConfig {
                private_key: Some(TEST_KEY.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        // Client defaults are valid
        assert!(Config::default().validate().is_ok());

        let config = Config {
            client: ClientConfig {
                interface_name: " ".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load("/nonexistent/veil/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_env_override_applies_after_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[engine]\nsocket_dir = \"/from/file\"\n")
            .unwrap();

        std::env::set_var("VEIL_ENGINE_SOCKET_DIR", "/from/env");
        let config = Config::load(file.path()).unwrap();
        std::env::remove_var("VEIL_ENGINE_SOCKET_DIR");

        assert_eq!(config.engine.socket_dir, "/from/env");
    }

    #[test]
    fn test_session_path_override() {
        let client = ClientConfig {
            session_file: Some("/tmp/veil/session.json".to_string()),
            ..Default::default()
        };
        assert_eq!(client.session_path(), PathBuf::from("/tmp/veil/session.json"));
        assert!(ClientConfig::default()
            .session_path()
            .ends_with(".veil/session.json"));
    }
}
