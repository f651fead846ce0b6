use cellgate::api::{ApiServer, PKG_NAME, VERSION};
use cellgate::config::Config;
use cellgate::docker::Engine;
use cellgate::gate::Gatekeeper;
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
                .add_directive("cellgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Configuration loaded"
    );

    // Connect to the container engine before accepting anything
    let engine = Arc::new(Engine::connect(config.engine.docker_host.as_deref()).await?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control-plane API (if enabled)
    let api_handle = if config.api.port > 0 {
        let api_addr: SocketAddr = format!("127.0.0.1:{}", config.api.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid API bind address: {}", e))?;
        let api_server = ApiServer::new(api_addr, Arc::clone(&engine), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = api_server.run().await {
                error!(error = %e, "Control-plane API error");
            }
        }))
    } else {
        None
    };

    // TCP gatekeeper
    let gatekeeper = Gatekeeper::new(config.gate.clone(), Arc::clone(&engine), shutdown_rx.clone());
    let registry = gatekeeper.registry();
    let gate_handle = tokio::spawn(async move {
        if let Err(e) = gatekeeper.run().await {
            error!(error = %e, "Gatekeeper error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Reclaim warm containers so they do not outlive the gatekeeper
    info!("Draining warm containers...");
    registry.drain(&engine).await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gate_handle.await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
