//! Text configuration protocol spoken by userspace tunnel engines.
//!
//! A request is a list of `key=value` lines terminated by a blank line,
//! prefixed with `set=1` or `get=1`. Every reply ends with `errno=<n>` and a
//! blank line. Keys travel as 64-char lowercase hex on this protocol only.

use shared_utils::keys::{decode_key, KeyError, KEY_LENGTH};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UapiError {
    #[error("engine rejected the request with errno={0}")]
    Errno(i64),

    #[error("malformed engine reply: {0}")]
    Malformed(String),
}

/// A key in the engine's hex encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct HexKey(String);

impl HexKey {
    /// Convert a base64 key, rejecting anything that is not exactly 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(&decode_key(encoded)?))
    }

    pub fn from_bytes(bytes: &[u8; KEY_LENGTH]) -> Self {
        HexKey(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Private keys pass through this type, so never print the value.
impl fmt::Debug for HexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HexKey([REDACTED])")
    }
}

/// Builder for the body of a `set=1` request.
///
/// Lines are emitted in call order; the engine applies peer-scoped keys to the
/// most recent `public_key` line.
#[derive(Debug, Default, Clone)]
pub struct UapiRequest {
    body: String,
}

impl UapiRequest {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.body.push_str(key);
        self.body.push('=');
        self.body.push_str(&value.to_string());
        self.body.push('\n');
        self
    }

    pub fn private_key(self, key: &HexKey) -> Self {
        self.line("private_key", key.as_str())
    }

    pub fn listen_port(self, port: u16) -> Self {
        self.line("listen_port", port)
    }

    pub fn public_key(self, key: &HexKey) -> Self {
        self.line("public_key", key.as_str())
    }

    pub fn endpoint(self, endpoint: SocketAddr) -> Self {
        self.line("endpoint", endpoint)
    }

    pub fn allowed_ip(self, cidr: &str) -> Self {
        self.line("allowed_ip", cidr)
    }

    pub fn persistent_keepalive(self, seconds: u16) -> Self {
        self.line("persistent_keepalive_interval", seconds)
    }

    pub fn remove(self) -> Self {
        self.line("remove", "true")
    }

    pub fn body(&self) -> &str {
        &self.body
    }

}

/// Frame a request body as a full `set=1` request, terminating blank line included.
pub fn set_command(body: &str) -> String {
    format!("set=1\n{body}\n")
}

/// Full `get=1` request.
pub const GET_COMMAND: &str = "get=1\n\n";

/// Interpret a reply line; returns `Some` once the `errno=` trailer is seen.
pub fn parse_errno(line: &str) -> Option<Result<(), UapiError>> {
    let value = line.trim().strip_prefix("errno=")?;
    Some(match value.parse::<i64>() {
        Ok(0) => Ok(()),
        Ok(errno) => Err(UapiError::Errno(errno)),
        Err(_) => Err(UapiError::Malformed(format!("bad errno value {value:?}"))),
    })
}

/// Per-peer counters from a `get=1` dump.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerDump {
    /// Hex public key
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Seconds since the epoch; 0 means no handshake yet
    pub last_handshake_sec: i64,
    pub last_handshake_nsec: u32,
}

/// Parsed `get=1` dump.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceDump {
    pub listen_port: Option<u16>,
    pub peers: Vec<PeerDump>,
}

impl DeviceDump {
    /// Parse the `key=value` lines of a dump (without the errno trailer).
    pub fn parse<'a, I>(lines: I) -> Result<Self, UapiError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, UapiError> {
            value
                .parse()
                .map_err(|_| UapiError::Malformed(format!("{key}={value}")))
        }

        let mut dump = DeviceDump::default();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| UapiError::Malformed(line.to_string()))?;

            if key == "public_key" {
                dump.peers.push(PeerDump {
                    public_key: value.to_string(),
                    ..Default::default()
                });
                continue;
            }

            match dump.peers.last_mut() {
                None => {
                    if key == "listen_port" {
                        dump.listen_port = Some(number(key, value)?);
                    }
                }
                Some(peer) => match key {
                    "endpoint" => peer.endpoint = Some(value.to_string()),
                    "allowed_ip" => peer.allowed_ips.push(value.to_string()),
                    "rx_bytes" => peer.rx_bytes = number(key, value)?,
                    "tx_bytes" => peer.tx_bytes = number(key, value)?,
                    "last_handshake_time_sec" => peer.last_handshake_sec = number(key, value)?,
                    "last_handshake_time_nsec" => peer.last_handshake_nsec = number(key, value)?,
                    _ => {}
                },
            }
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_PRIVATE: &str = "YNqHbfBQKaGvzefSSLXYKoaaI9d6DvrULEgqRaD5mXo=";

    #[test]
    fn base64_key_becomes_lowercase_hex() {
        let key = HexKey::from_base64(SERVER_PRIVATE).unwrap();
        assert_eq!(key.as_str().len(), 64);
        assert!(key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(key.as_str(), hex::encode(decode_key(SERVER_PRIVATE).unwrap()));
    }

    #[test]
    fn wrong_length_key_is_an_error() {
        assert_eq!(
            HexKey::from_base64("AAAA"),
            Err(KeyError::InvalidLength {
                expected: 32,
                actual: 3
            })
        );
    }

    #[test]
    fn debug_never_shows_key_material() {
        let key = HexKey::from_base64(SERVER_PRIVATE).unwrap();
        assert_eq!(format!("{key:?}"), "HexKey([REDACTED])");
    }

    #[test]
    fn set_command_for_a_peer() {
        let peer = HexKey::from_bytes(&[1u8; 32]);
        let request = UapiRequest::new()
            .public_key(&peer)
            .endpoint("203.0.113.7:51820".parse().unwrap())
            .persistent_keepalive(25)
            .allowed_ip("0.0.0.0/0");

        assert_eq!(
            set_command(request.body()),
            format!(
                "set=1\npublic_key={}\nendpoint=203.0.113.7:51820\npersistent_keepalive_interval=25\nallowed_ip=0.0.0.0/0\n\n",
                "01".repeat(32)
            )
        );
    }

    #[test]
    fn removal_request() {
        let peer = HexKey::from_bytes(&[0xffu8; 32]);
        let body = UapiRequest::new().public_key(&peer).remove();
        assert_eq!(body.body(), format!("public_key={}\nremove=true\n", "ff".repeat(32)));
    }

    #[test]
    fn errno_trailer() {
        assert_eq!(parse_errno("errno=0"), Some(Ok(())));
        assert_eq!(parse_errno("errno=-22\n"), Some(Err(UapiError::Errno(-22))));
        assert!(matches!(parse_errno("errno=x"), Some(Err(UapiError::Malformed(_)))));
        assert_eq!(parse_errno("rx_bytes=10"), None);
    }

    #[test]
    fn dump_groups_counters_by_peer() {
        let text = "private_key=00\nlisten_port=51820\n\
                    public_key=aa\nendpoint=198.51.100.2:4000\nlast_handshake_time_sec=1700000000\n\
                    last_handshake_time_nsec=5\nrx_bytes=100\ntx_bytes=200\nallowed_ip=10.0.0.2/32\n\
                    public_key=bb\nrx_bytes=1\ntx_bytes=2\nlast_handshake_time_sec=0\n";

        let dump = DeviceDump::parse(text.lines()).unwrap();

        assert_eq!(dump.listen_port, Some(51820));
        assert_eq!(dump.peers.len(), 2);
        assert_eq!(dump.peers[0].public_key, "aa");
        assert_eq!(dump.peers[0].endpoint.as_deref(), Some("198.51.100.2:4000"));
        assert_eq!(dump.peers[0].allowed_ips, vec!["10.0.0.2/32".to_string()]);
        assert_eq!(dump.peers[0].rx_bytes, 100);
        assert_eq!(dump.peers[0].last_handshake_sec, 1_700_000_000);
        assert_eq!(dump.peers[1].tx_bytes, 2);
        assert_eq!(dump.peers[1].last_handshake_sec, 0);
    }

    #[test]
    fn dump_rejects_garbage_counters() {
        let err = DeviceDump::parse(["public_key=aa", "rx_bytes=lots"]).unwrap_err();
        assert!(matches!(err, UapiError::Malformed(_)));
    }
}
