//! fleet daemon
//!
//! Serves the instance API of one cluster member. In development mode the
//! cluster store and the local instances live in memory, seeded from a JSON
//! file.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_daemon::{
    api,
    client::HttpNodeConnector,
    config::Config,
    listing::InstanceLister,
    memory::ClusterSeed,
    operation::TokioOperationRunner,
    remote::{ClusterCert, RemoteFetcher},
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet daemon");
    info!(
        listen_addr = %config.listen_addr,
        node = %config.node_name,
        render_workers = config.listing.render_workers,
        remote_timeout_secs = config.listing.remote_timeout.as_secs(),
        "Configuration loaded"
    );

    let seed = match &config.seed_file {
        Some(path) => ClusterSeed::from_file(path)?,
        None => {
            warn!("No seed file configured, starting with an empty cluster");
            ClusterSeed::default()
        }
    };
    let (store, instances) = seed.build(&config.node_name)?;
    let instances = Arc::new(instances);

    let (cert, connector) = match (&config.cluster_cert_path, &config.cluster_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = ClusterCert {
                certificate: std::fs::read_to_string(cert_path).with_context(|| {
                    format!("failed to read cluster certificate {}", cert_path.display())
                })?,
                key: std::fs::read_to_string(key_path).with_context(|| {
                    format!("failed to read cluster key {}", key_path.display())
                })?,
            };
            (cert, HttpNodeConnector::new())
        }
        _ => {
            warn!("No cluster certificate configured, talking to other nodes over plain HTTP");
            (ClusterCert::default(), HttpNodeConnector::plain_http())
        }
    };

    let fetcher = RemoteFetcher::new(
        Arc::new(connector),
        Arc::new(cert),
        config.listing.remote_timeout,
    );
    let lister = InstanceLister::new(
        Arc::new(store),
        instances.clone(),
        fetcher,
        config.listing.render_pool(),
        config.listing.retry_policy(),
    );

    // Create application state
    let state = AppState::new(
        config.node_name.clone(),
        lister,
        instances,
        Arc::new(TokioOperationRunner::new()),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("fleet daemon shutdown complete");
    Ok(())
}
