//! Tenantry API Server
//!
//! Serves signup, verification, and tenant-scoped routes, and runs the
//! provisioning queue in the background.

use std::net::SocketAddr;
use std::sync::Arc;
use tenantry_api::{http, AppConfig, Services, TracingOtpDelivery};
use tenantry_core::Result;
use tenantry_storage::ConnectionPoolConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    let pool_config = ConnectionPoolConfig::from_env();
    pool_config.validate()?;
    tracing::info!(config = ?config, "Starting tenantry server");

    let services = Services::connect(&config, pool_config).await?;
    let applied = services.migrate().await?;
    if applied > 0 {
        tracing::info!(applied, "Applied control-plane migrations");
    }

    let pools = Arc::clone(&services.pools);
    let reaper = pools.spawn_idle_reaper();

    let state = services.into_app_state(&config, Arc::new(TracingOtpDelivery))?;
    let queue = Arc::clone(&state.queue);
    let app = http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| tenantry_core::TenancyError::Configuration(format!("Failed to bind {}: {}", addr, e)))?;
    tracing::info!(addr = %addr, "Listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    queue.shutdown().await;
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    pools.close_all().await;

    served.map_err(|e| tenantry_core::TenancyError::Other(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
