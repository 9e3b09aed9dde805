use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared_utils::config::Config;
use shared_utils::keys::{KeyProvider, X25519KeyProvider};
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use veil_client::routing::system_routing_table;
use veil_client::{ClientSessionConfig, ClientTunnelSession, PingProber, SessionSettings};
use veil_engine::engine::EngineSettings;
use veil_engine::{EngineBackend, ProcessEngine};

#[derive(Parser, Debug)]
#[command(author, version, about = "Veil tunnel client", long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults apply when it does not exist)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (trace|debug|info|warn|error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the tunnel up and hold it until Ctrl-C
    Connect,
    /// Show the stored session profile
    Status,
    /// Print a fresh key pair
    Keygen,
    /// Store the session profile handed out by the server
    Enroll {
        /// Server public key (base64)
        #[arg(long)]
        server_key: String,
        /// Server endpoint, host:port
        #[arg(long)]
        endpoint: String,
        /// Tunnel address assigned to this client
        #[arg(long)]
        address: String,
        /// Server address inside the tunnel
        #[arg(long, default_value = "10.0.0.1")]
        server_tunnel_address: Ipv4Addr,
        /// Existing client private key; a new one is generated otherwise
        #[arg(long)]
        private_key: Option<String>,
    },
    /// Delete the stored session profile
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let _guard = init_logging(LogOptions {
        level: parse_level(level),
        log_file_name: "veil-client".to_string(),
        include_file_line: false,
        ..Default::default()
    });

    let keys = X25519KeyProvider;
    let session_path = config.client.session_path();

    match cli.command {
        Commands::Keygen => {
            let pair = keys.generate();
            println!("private_key = {}", pair.private_key);
            println!("public_key  = {}", pair.public_key);
        }
        Commands::Enroll {
            server_key,
            endpoint,
            address,
            server_tunnel_address,
            private_key,
        } => {
            let (client_private_key, client_public_key) = match private_key {
                Some(private) => {
                    let public = keys.public_key(&private)?;
                    (private, public)
                }
                None => {
                    let pair = keys.generate();
                    (pair.private_key, pair.public_key)
                }
            };
            let profile = ClientSessionConfig {
                client_private_key,
                client_public_key,
                server_public_key: server_key,
                server_endpoint: endpoint,
                assigned_address: address,
                server_tunnel_address,
                registered_at: Utc::now(),
            };
            profile.validate(&keys)?;
            profile.save(&session_path).await?;
            println!("client public key: {}", profile.client_public_key);
        }
        Commands::Forget => {
            if ClientSessionConfig::delete(&session_path).await? {
                println!("removed {}", session_path.display());
            } else {
                println!("no session profile at {}", session_path.display());
            }
        }
        Commands::Status => {
            let Some(profile) = ClientSessionConfig::load(&session_path).await? else {
                println!("not registered (no profile at {})", session_path.display());
                return Ok(());
            };
            let session = build_session(&config, &profile)?;
            println!("{}", serde_json::to_string_pretty(&session.status().await)?);
        }
        Commands::Connect => {
            let Some(profile) = ClientSessionConfig::load(&session_path).await? else {
                bail!(
                    "not registered: no session profile at {}; run `veil-client enroll` first",
                    session_path.display()
                );
            };
            profile.validate(&keys)?;

            let mut session = build_session(&config, &profile)?;
            session.connect().await?;
            println!("{}", serde_json::to_string_pretty(&session.status().await)?);

            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err}");
            }
            info!("disconnecting");
            if let Err(err) = session.disconnect().await {
                warn!("disconnect: {err}");
            }
        }
    }

    Ok(())
}

fn build_session<'a>(
    config: &Config,
    profile: &'a ClientSessionConfig,
) -> Result<ClientTunnelSession<'a>> {
    let settings = SessionSettings::from_config(&config.client)?;
    let engine = Arc::new(ProcessEngine::new(EngineSettings::from(&config.engine)));
    Ok(ClientTunnelSession::new(
        profile,
        settings,
        Box::new(EngineBackend::new(engine)),
        system_routing_table(),
        Box::new(PingProber::default()),
    ))
}
