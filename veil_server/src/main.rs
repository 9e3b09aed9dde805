use anyhow::{bail, Context, Result};
use clap::Parser;
use shared_utils::config::{Config, Role};
use shared_utils::keys::{KeyProvider, X25519KeyProvider};
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use veil_engine::engine::EngineSettings;
use veil_engine::{EngineBackend, ProcessEngine};
use veil_server::{backend_config, AddressAllocator, ControlPlane, PeerRegistry};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Veil tunnel server control plane")]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_name = "FILE", default_value = "/etc/veil/server.toml")]
    config: PathBuf,

    /// Log level override (trace|debug|info|warn|error)
    #[clap(short, long)]
    log_level: Option<String>,

    /// Also write logs to this directory
    #[clap(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Emit JSON formatted logs
    #[clap(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if config.role != Role::Server {
        bail!("{} is not a server configuration", args.config.display());
    }

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let _guard = init_logging(LogOptions {
        level: parse_level(level),
        log_to_file: args.log_dir.is_some(),
        log_dir: args.log_dir.clone().unwrap_or_else(|| "./logs".to_string()),
        log_file_name: "veil-server".to_string(),
        json_format: args.json_logs,
        ..Default::default()
    });
    info!(config = %args.config.display(), "starting Veil server");

    let keys: Arc<dyn KeyProvider> = Arc::new(X25519KeyProvider);
    let registry = Arc::new(
        PeerRegistry::open(config.server.registry_path())
            .await
            .context("opening peer registry")?,
    );
    let allocator = AddressAllocator::from_config(&config.ipam)?;
    let engine = Arc::new(ProcessEngine::new(EngineSettings::from(&config.engine)));
    let backend = Arc::new(EngineBackend::new(engine));

    let plane = ControlPlane::new(backend, registry, allocator, keys);
    plane.start(backend_config(&config.server)?).await?;

    let info = plane.server_info().await?;
    let network = plane.allocator().network_info();
    info!(
        public_key = %info.public_key,
        endpoint = %info.endpoint,
        address = %info.server_address,
        pool = %network.cidr,
        range = %network.range,
        clients = plane.registry().count().await,
        "server ready"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
    }
    info!("shutting down");
    plane.stop(config.server.stop_timeout()).await;
    Ok(())
}
