//! robogate-daemon binary.
//!
//! Loads configuration, builds the gateway, spawns the background tasks,
//! serves the HTTP/WebSocket surface, and tears everything down in order on
//! SIGINT/SIGTERM. Exits nonzero on bind failure or a fatal service
//! manager error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use robogate_core::config::GatewayConfig;
use robogate_daemon::routes::build_router;
use robogate_daemon::Gateway;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// robogate - hardware-control gateway for agent-driven robots
#[derive(Parser, Debug)]
#[command(name = "robogate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to gateway configuration file
    #[arg(short, long, default_value = "robogate.toml")]
    config: PathBuf,

    /// Bind address (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Use simulated adapters instead of live backends
    #[arg(long)]
    dry_run: bool,

    /// Start every supervised service on startup
    #[arg(long)]
    auto_start_services: bool,

    /// Disable service management entirely
    #[arg(long)]
    no_service_manager: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = if args.config.exists() {
        GatewayConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        GatewayConfig::default()
    };

    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.dry_run {
        config.server.dry_run = true;
    }
    if args.auto_start_services {
        config.services.auto_start = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !args.config.exists() {
        info!(config = %args.config.display(), "no config file found, using defaults");
    }
    let config = load_config(&args)?;
    let auto_start = config.services.auto_start;
    let dry_run = config.server.dry_run;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let gateway = Gateway::new(config, !args.no_service_manager)
        .context("failed to build gateway (check service definitions)")?;

    gateway.connect_backends().await;
    gateway.start_background().await;
    if auto_start {
        info!("auto-starting supervised services");
        gateway.auto_start_services().await;
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, dry_run, "gateway listening");

    // SIGINT/SIGTERM trigger the root cancellation token, which drains the
    // server and every background task.
    {
        let cancel = gateway.cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            cancel.cancel();
        });
    }

    let router = build_router(Arc::clone(&gateway));
    let shutdown_cancel = gateway.cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown_cancel.cancelled().await })
        .await
        .context("server error")?;

    gateway.shutdown().await;
    Ok(())
}
