//! minibusd - the minibus message broker daemon.
//!
//! Binds the configured endpoints, runs the router, and serves peers until
//! SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use minibus_daemon::config::BrokerConfig;
use minibus_daemon::observer::ObserverFeed;
use minibus_daemon::router::{NoForwarder, Router};
use minibus_daemon::server::BrokerServer;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// minibus - a D-Bus message broker
#[derive(Parser, Debug)]
#[command(name = "minibusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the broker configuration file
    #[arg(short, long, default_value = "minibus.toml")]
    config: PathBuf,

    /// Listening socket path (overrides the config file)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Debug TCP endpoint, e.g. 127.0.0.1:7878 (overrides the config file)
    #[arg(long)]
    tcp_listen: Option<SocketAddr>,

    /// Deliver broadcast signals to peers without match rules
    #[arg(long)]
    compat_broadcast: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if args.config.exists() {
        BrokerConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        BrokerConfig::default()
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(addr) = args.tcp_listen {
        config.tcp_listen = Some(addr);
    }
    if args.compat_broadcast {
        config.compat_broadcast = true;
    }
    let config = Arc::new(config);

    info!(
        bus_id = %config.bus_id,
        socket = %config.socket_path.display(),
        "starting minibusd"
    );

    let observer = ObserverFeed::default();
    let (router_tx, router) = Router::new(
        Arc::clone(&config),
        observer.clone(),
        Box::new(NoForwarder),
    );
    let router_task = tokio::spawn(router.run());

    let server = BrokerServer::bind(Arc::clone(&config), router_tx)
        .await
        .context("failed to bind listening endpoints")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    server.run(shutdown).await;

    // Dropping the server released the last direct mailbox sender; the
    // router drains the peers still winding down and then stops.
    if let Err(err) = router_task.await {
        warn!(error = %err, "router task ended abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = sigint.recv() => info!("SIGINT received"),
        }
        shutdown.cancel();
    });
    Ok(())
}
