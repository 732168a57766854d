use confgate::config::Config;
use confgate::control::{ControlServer, PKG_NAME, VERSION};
use confgate::engine::ListenerEngine;
use confgate::registry::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("confgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; the file is optional, defaults match the reference
    // deployment (control API on 0.0.0.0:6543).
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    info!(
        name = PKG_NAME,
        version = VERSION,
        bind = %config.server.bind,
        control_port = config.server.control_port,
        "Starting control plane"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build the registry around the built-in engine
    let engine = Arc::new(ListenerEngine::new());
    let registry = Registry::new(engine);

    // Create the control API server
    let control_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.control_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.control_port, error = %e,
                "Invalid control bind address");
            anyhow::anyhow!("Invalid control bind address: {}", e)
        })?;

    let control_server = ControlServer::new(control_addr, Arc::clone(&registry), shutdown_rx);
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all workers
    info!("Stopping all workers...");
    registry.stop_all().await;

    // Wait for the control server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    info!("Shutdown complete");
    Ok(())
}
