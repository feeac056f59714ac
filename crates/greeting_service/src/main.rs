//! Greeting service entry point.

use anyhow::{Context, Result};
use greeting_service::{serve, AppState, ServiceConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Greeting service");

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  GREETING_INTERVAL_MS: {}", config.greeting_interval.as_millis());
    info!("  OUTBOUND_BUFFER: {}", config.outbound_buffer);
    info!("  RPC_SECURED_ROUTES: {}", config.secured_routes.join(","));

    if let Some(metrics_port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], metrics_port))
            .install()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics server started on port {}", metrics_port);
    }

    let state = Arc::new(AppState::from_config(&config)?);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Greeting service listening on {}", addr);

    serve(listener, state, shutdown_signal()).await?;

    info!("Greeting service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
