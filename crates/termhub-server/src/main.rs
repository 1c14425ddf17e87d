//! termhub: terminal session manager.
//!
//! Runs PTY-backed sessions (optionally persisted in tmux), exposes them over
//! a WebSocket control channel and per-session streams, and hands out ports
//! from a host-wide pool.

mod config;
mod ports;
mod server;
mod session;
mod transport;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::{CliOverrides, ServerConfig};
use ports::PortAllocator;
use server::TermServer;
use session::{Escalation, NixSignaller, PersistenceBridge};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// termhub: terminal session manager
#[derive(Parser, Debug)]
#[command(name = "termhub", version, about = "Terminal session manager")]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Preview lines kept per session
        #[arg(long)]
        buffer_lines: Option<usize>,

        /// Write a JSONL transcript per session into this directory
        #[arg(long)]
        recording_dir: Option<String>,
    },
    /// Inspect or edit the shared port pool
    Ports {
        /// Registry file (overrides the config)
        #[arg(long)]
        registry: Option<String>,

        #[command(subcommand)]
        action: PortsAction,
    },
    /// Manage tmux-backed sessions directly
    Persistent {
        #[command(subcommand)]
        action: PersistentAction,
    },
}

#[derive(Subcommand, Debug)]
enum PortsAction {
    /// Print the pool
    Show,
    /// Reserve ports
    Allocate { count: usize },
    /// Return ports
    Release {
        #[arg(required = true)]
        ports: Vec<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum PersistentAction {
    /// List persistent sessions
    List,
    /// Terminate a persistent session
    Kill { name: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Serve {
            bind,
            port,
            buffer_lines,
            recording_dir,
        } => {
            let overrides = CliOverrides {
                bind,
                port,
                buffer_lines,
                recording_dir,
                ..CliOverrides::default()
            };
            serve(cli.config, overrides).await
        }
        Command::Ports { registry, action } => {
            let overrides = CliOverrides {
                port_registry: registry,
                ..CliOverrides::default()
            };
            ports_command(cli.config, overrides, action).await
        }
        Command::Persistent { action } => persistent_command(cli.config, action).await,
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "termhub failed");
        std::process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>, overrides: &CliOverrides) -> anyhow::Result<ServerConfig> {
    ServerConfig::load(path.as_deref(), overrides).context("failed to load config")
}

async fn serve(config_path: Option<PathBuf>, overrides: CliOverrides) -> anyhow::Result<()> {
    let config = load_config(config_path, &overrides)?;
    if let Some(dir) = &config.sessions.recording_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create recording dir {}", dir.display()))?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        "starting termhub"
    );

    let server = Arc::new(TermServer::new(config).await);

    tokio::select! {
        result = server.clone().run() => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("termhub stopped");
    Ok(())
}

async fn ports_command(
    config_path: Option<PathBuf>,
    overrides: CliOverrides,
    action: PortsAction,
) -> anyhow::Result<()> {
    let config = load_config(config_path, &overrides)?;
    let allocator = PortAllocator::new(&config.port_registry, config.port_start, config.port_end);

    let output = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        match action {
            PortsAction::Show => {
                let pool = allocator.snapshot()?;
                Ok(serde_json::to_string_pretty(&pool)?)
            }
            PortsAction::Allocate { count } => {
                let ports = allocator.allocate(count)?;
                Ok(serde_json::to_string(&ports)?)
            }
            PortsAction::Release { ports } => {
                allocator.release(&ports)?;
                Ok(format!("released {} port(s)", ports.len()))
            }
        }
    })
    .await
    .context("port registry task failed")??;

    println!("{output}");
    Ok(())
}

async fn persistent_command(
    config_path: Option<PathBuf>,
    action: PersistentAction,
) -> anyhow::Result<()> {
    let config = load_config(config_path, &CliOverrides::default())?;
    let settings = &config.sessions;
    let Some(bridge) = PersistenceBridge::detect(settings.readiness, settings.cols, settings.rows).await
    else {
        bail!("tmux is not available on this host");
    };

    match action {
        PersistentAction::List => {
            let sessions = bridge.list_sessions().await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        PersistentAction::Kill { name } => {
            if !bridge.session_exists(&name).await {
                bail!("no persistent session named {name}");
            }
            let escalation = Escalation::new(Arc::new(NixSignaller), settings.grace);
            let report = bridge.terminate(&name, &escalation).await;
            println!(
                "terminated {name} ({} pane(s), {} forced)",
                report.signalled.len(),
                report.forced.len()
            );
        }
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
