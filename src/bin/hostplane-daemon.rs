use anyhow::{Context, Result};
use clap::Parser;
use hostplane::config::PlatformConfig;
use hostplane::ipc::IpcServer;
use hostplane::plane::ControlPlane;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// hostplane daemon - serves the control plane on a Unix socket
#[derive(Parser)]
#[command(name = "hostplane-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "HOSTPLANE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the socket path from the configuration
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PlatformConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PlatformConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.paths.socket_path = socket;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("building log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let socket_path = config.paths.socket_path.clone();
    let plane = Arc::new(
        ControlPlane::native(config).context("initializing control plane")?,
    );
    plane.start().await;

    let mut server = IpcServer::new(&socket_path);
    server.bind().context("binding control socket")?;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    };

    let handler_plane = Arc::clone(&plane);
    server
        .run(
            move |command| {
                let plane = Arc::clone(&handler_plane);
                async move { plane.execute(command).await }
            },
            shutdown,
        )
        .await
        .context("serving control socket")?;

    server.stop().context("removing control socket")?;
    plane.shutdown().await.context("shutting down control plane")?;
    info!("Daemon shutdown complete");
    Ok(())
}
