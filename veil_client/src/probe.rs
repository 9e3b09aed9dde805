//! Reachability probes used to verify a fresh tunnel.

use async_trait::async_trait;
use shared_utils::command::command_succeeds;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Answers "can we reach this address within the timeout?".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: IpAddr, timeout: Duration) -> bool;
}

/// ICMP echo through the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProber {
    command: String,
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl PingProber {
    pub fn new(command: impl Into<String>) -> Self {
        PingProber {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: IpAddr, timeout: Duration) -> bool {
        let wait = timeout.as_secs().max(1).to_string();
        let target = target.to_string();
        let args = ["-c", "1", "-W", wait.as_str(), target.as_str()];

        // ping's own -W only bounds the reply wait, not name lookup or startup
        match tokio::time::timeout(timeout + Duration::from_secs(1), command_succeeds(&self.command, &args)).await {
            Ok(Ok(reachable)) => {
                debug!(%target, reachable, "probe finished");
                reachable
            }
            Ok(Err(err)) => {
                warn!(%target, "probe could not run: {err}");
                false
            }
            Err(_) => {
                debug!(%target, "probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn exit_status_decides() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(PingProber::new("true").probe(localhost, Duration::from_secs(1)).await);
        assert!(!PingProber::new("false").probe(localhost, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn missing_binary_is_unreachable() {
        let prober = PingProber::new("/nonexistent/ping");
        assert!(!prober.probe(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_secs(1)).await);
    }
}
