use super::{EngineDevice, EngineError, EngineResult, TunnelEngine};
use crate::uapi::{parse_errno, set_command, UapiError, GET_COMMAND};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use shared_utils::command::{command_succeeds, run_command};
use shared_utils::config::EngineConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How to launch the engine process.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub command: String,
    /// Arguments placed before the interface name
    pub args: Vec<String>,
    pub socket_dir: PathBuf,
    pub startup_timeout: Duration,
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        EngineSettings {
            command: config.command.clone(),
            args: config.args.clone(),
            socket_dir: PathBuf::from(&config.socket_dir),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// Runs a userspace engine (`wireguard-go`, `boringtun-cli`, ...) as a child
/// process and talks to it over `<socket_dir>/<interface>.sock`.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    settings: EngineSettings,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

#[async_trait]
impl TunnelEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.settings.command
    }

    async fn create_device(&self, interface: &str) -> EngineResult<Box<dyn EngineDevice>> {
        let socket_path = self.settings.socket_dir.join(format!("{interface}.sock"));

        if fs::try_exists(&socket_path).await? {
            if command_succeeds("ip", &["link", "show", "dev", interface]).await? {
                return Err(EngineError::Startup(format!(
                    "interface {interface} is already managed by another engine"
                )));
            }
            warn!(socket = %socket_path.display(), "removing stale engine socket");
            fs::remove_file(&socket_path).await?;
        }

        let mut child = TokioCommand::new(&self.settings.command)
            .args(&self.settings.args)
            .arg(interface)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Startup(format!("failed to launch {}: {e}", self.settings.command))
            })?;

        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if fs::try_exists(&socket_path).await? {
                break;
            }
            if let Some(status) = child.try_wait()? {
                return Err(EngineError::Startup(format!(
                    "{} exited with {status} before opening {}",
                    self.settings.command,
                    socket_path.display()
                )));
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(EngineError::Startup(format!(
                    "timed out waiting for {}",
                    socket_path.display()
                )));
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }

        info!(
            engine = %self.settings.command,
            interface,
            pid = ?child.id(),
            "tunnel engine started"
        );

        Ok(Box::new(ProcessDevice {
            interface: interface.to_string(),
            socket_path,
            child: Some(child),
        }))
    }
}

struct ProcessDevice {
    interface: String,
    socket_path: PathBuf,
    child: Option<Child>,
}

impl ProcessDevice {
    /// Send one request and collect reply lines up to the errno trailer.
    async fn exchange(&self, request: &str) -> EngineResult<Vec<String>> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Err(UapiError::Malformed("connection closed before errno".into()).into());
            }
            if let Some(result) = parse_errno(&line) {
                result?;
                return Ok(lines);
            }
            let line = line.trim_end();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
    }
}

#[async_trait]
impl EngineDevice for ProcessDevice {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn ipc_set(&mut self, body: &str) -> EngineResult<()> {
        self.exchange(&set_command(body)).await.map(|_| ())
    }

    async fn ipc_get(&mut self) -> EngineResult<Vec<String>> {
        self.exchange(GET_COMMAND).await
    }

    async fn bring_up(&mut self, address: &str) -> EngineResult<()> {
        match run_command("ip", &["address", "add", address, "dev", &self.interface]).await {
            Ok(_) => {}
            Err(err) if err.stderr().contains("File exists") => {
                debug!(interface = %self.interface, address, "address already assigned");
            }
            Err(err) => return Err(err.into()),
        }
        run_command("ip", &["link", "set", "up", "dev", &self.interface]).await?;
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(interface = %self.interface, pid, "failed to signal engine: {err}");
                }
            }

            match timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(interface = %self.interface, %status, "engine exited"),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    warn!(interface = %self.interface, "engine ignored SIGTERM, killing");
                    child.kill().await?;
                }
            }
        }

        match fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(socket = %self.socket_path.display(), "failed to remove engine socket: {err}"),
        }
        Ok(())
    }

    async fn remove_interface(&mut self) -> EngineResult<()> {
        if !command_succeeds("ip", &["link", "show", "dev", &self.interface]).await? {
            return Ok(());
        }
        run_command("ip", &["link", "delete", "dev", &self.interface]).await?;
        info!(interface = %self.interface, "tunnel interface deleted");
        Ok(())
    }
}
