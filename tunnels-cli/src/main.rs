//! Tunnels VPN CLI
//!
//! Without a subcommand the binary runs the client daemon: it loads the
//! state under `--basePath`, applies the flags to `tunnels.json` and brings
//! up every configured tunnel. `serve` runs the server data plane.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use tnl_tun::TunNicFactory;
use tunnels_engine::{
    build_resolver, AppState, ClientEngine, Config, Credentials, HttpControlPlane, HttpsConnector,
    ServerEngine, SessionNegotiator, TunnelConfig, UdpDialer,
};

/// Tag of the tunnel created from `--serverID` when none is configured
const DEFAULT_TUNNEL: &str = "default";

/// Grace period for tasks to wind down after a signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunnels VPN
#[derive(Parser)]
#[command(name = "tunnels")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Controller host
    #[arg(long = "authHost")]
    auth_host: Option<String>,

    #[arg(long = "deviceID")]
    device_id: Option<String>,

    /// Server to connect to
    #[arg(long = "serverID")]
    server_id: Option<String>,

    /// Run the local DNS resolver
    #[arg(long, action = ArgAction::Set)]
    dns: Option<bool>,

    /// Validate TLS certificates
    #[arg(long, action = ArgAction::Set)]
    secure: Option<bool>,

    /// Report host CPU, memory and disk usage in heartbeats
    #[arg(long = "sendStats", action = ArgAction::Set)]
    send_stats: Option<bool>,

    /// Directory holding tunnels.json, tunnel/, logs/ and blocklists/
    #[arg(long = "basePath", default_value = ".")]
    base_path: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server data plane
    Serve {
        /// Path to the server configuration file
        #[arg(short, long, default_value = "tunnels-server.toml")]
        config: PathBuf,
    },

    /// Generate a sample server configuration file
    GenConfig {
        #[arg(short, long, default_value = "tunnels-server.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Serve { ref config }) => run_server(config).await,
        Some(Commands::GenConfig { ref output }) => generate_config(output),
        None => run_client(&cli).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Persist the flags that were given into `tunnels.json`
fn apply_flags(state: &AppState, cli: &Cli) -> Result<()> {
    state
        .update_root(|root| {
            if let Some(host) = &cli.auth_host {
                root.auth_host = host.clone();
            }
            if let Some(id) = &cli.device_id {
                root.device_id = id.clone();
            }
            if let Some(id) = &cli.server_id {
                root.server_id = id.clone();
            }
            if let Some(dns) = cli.dns {
                root.dns_enabled = dns;
            }
            if let Some(secure) = cli.secure {
                root.secure = secure;
            }
            if let Some(send_stats) = cli.send_stats {
                root.send_stats = send_stats;
            }
        })
        .context("Failed to update tunnels.json")?;
    Ok(())
}

async fn run_client(cli: &Cli) -> Result<()> {
    let state = Arc::new(
        AppState::load(&cli.base_path)
            .with_context(|| format!("Failed to load state from {:?}", cli.base_path))?,
    );
    apply_flags(&state, cli)?;
    let root = state.root();
    logging::init(&root.log_level, Some(&state.paths().log_dir()))?;
    info!("Starting tunnels client, state in {:?}", cli.base_path);

    tunnels_engine::telemetry::require_privileges()?;

    let credentials = Credentials::load(&state.paths().credentials_file())
        .context("Failed to load credentials; sign in first")?;

    if state.tunnels().is_empty() {
        if root.server_id.is_empty() {
            bail!("no tunnels configured and no --serverID given");
        }
        state
            .add_tunnel(TunnelConfig::new(DEFAULT_TUNNEL, root.server_id.clone()))
            .context("Failed to create the default tunnel")?;
        info!("Created tunnel '{}' for server {}", DEFAULT_TUNNEL, root.server_id);
    }

    let control = Arc::new(
        HttpControlPlane::new(root.controller_url(), root.secure)
            .context("Failed to create controller client")?,
    );
    let connector = Arc::new(HttpsConnector::new(root.secure)?);
    let negotiator = SessionNegotiator::new(control, connector, Arc::new(UdpDialer));
    let nics = Arc::new(TunNicFactory::default());

    let mut engine = ClientEngine::new(state.clone(), credentials, negotiator, nics);
    if root.dns_enabled {
        let resolver =
            build_resolver(&root, state.paths()).context("Failed to set up the DNS resolver")?;
        engine = engine.with_resolver(resolver);
    }
    let engine = Arc::new(engine);
    let mut runner = tokio::spawn(engine.clone().run());

    for tunnel in state.tunnels() {
        match engine.connect(&tunnel.tag).await {
            Ok(session) => info!("Tunnel '{}' up as session {}", tunnel.tag, session.index),
            Err(e) => warn!("Tunnel '{}' failed to connect: {}", tunnel.tag, e),
        }
    }

    tokio::select! {
        signal = wait_for_shutdown() => signal?,
        result = &mut runner => {
            return match result {
                Ok(result) => result.context("Client engine failed"),
                Err(e) => Err(anyhow!("client engine task failed: {}", e)),
            };
        }
    }
    info!("Shutting down client...");
    engine.stop();
    match tokio::time::timeout(SHUTDOWN_GRACE, runner).await {
        Ok(Ok(result)) => result.context("Client engine failed")?,
        Ok(Err(e)) => bail!("client engine task failed: {}", e),
        Err(_) => warn!("Client engine did not stop within {:?}", SHUTDOWN_GRACE),
    }
    Ok(())
}

async fn run_server(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    logging::init(&config.common.log_level, config.common.log_dir.as_deref())?;
    info!("Starting tunnels server, configuration from {:?}", config_path);

    let server = config.server_config()?.clone();
    let engine = Arc::new(ServerEngine::new(server).context("Invalid server configuration")?);
    let mut runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    tokio::select! {
        signal = wait_for_shutdown() => signal?,
        // Only returns before a signal when startup failed
        result = &mut runner => {
            return match result {
                Ok(result) => result.context("Server engine failed"),
                Err(e) => Err(anyhow!("server engine task failed: {}", e)),
            };
        }
    }
    info!("Shutting down server...");
    engine.stop();
    match tokio::time::timeout(SHUTDOWN_GRACE, runner).await {
        Ok(Ok(result)) => result.context("Server engine failed")?,
        Ok(Err(e)) => bail!("server engine task failed: {}", e),
        Err(_) => warn!("Server engine did not stop within {:?}", SHUTDOWN_GRACE),
    }
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    std::fs::write(output, Config::sample())
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;
    println!("Sample configuration written to {:?}", output);
    println!("\nSet server_id and the key and certificate paths before running.");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }
    Ok(())
}
