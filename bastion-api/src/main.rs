//! BASTION API Server Entry Point
//!
//! Loads configuration from the environment, connects the remote store,
//! wires application state, starts the sweepers and serves HTTP until
//! Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use bastion_api::{
    create_router, init_tracing, ApiError, ApiResult, AppState, StaticCredentialStore,
    TelemetryConfig,
};
use bastion_core::BastionConfig;
use bastion_storage::{InMemoryRemoteStore, RedisRemoteStore, RemoteStore};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::from_env())?;

    let config = BastionConfig::from_env();
    config.validate()?;

    let remote = connect_remote(&config).await;
    let credential_store = Arc::new(StaticCredentialStore::from_env());
    if credential_store.is_empty() {
        tracing::warn!("BASTION_API_KEYS is empty; every API key will be rejected");
    }

    let state = AppState::build(config, remote, credential_store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweepers = state.spawn_sweepers(shutdown_rx);

    let app = create_router(state);
    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, "Starting BASTION API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
    })
    .await
    .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    let _ = shutdown_tx.send(true);
    for sweeper in sweepers {
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Sweeper task failed");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Redis when reachable; otherwise a process-local store so the server
/// still starts. The breaker treats the local store like any other L2.
async fn connect_remote(config: &BastionConfig) -> Arc<dyn RemoteStore> {
    match RedisRemoteStore::connect(&config.redis).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, using in-process remote store");
            Arc::new(InMemoryRemoteStore::new())
        }
    }
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("BASTION_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("BASTION_API_PORT").ok())
        .unwrap_or_else(|| "3000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
