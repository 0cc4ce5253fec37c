//! Speech recognition server.
//!
//! Loads the configuration and model, then serves streaming sessions over
//! WebSocket and offline batches over HTTP until SIGINT or SIGTERM.

use std::sync::Arc;

use tracing::{info, warn};

use amira_asr_runtime::{
    api::load_resources,
    config::Config,
    error::Result,
    reliability::{drain_sessions, init_tracing, GracefulShutdown},
    server::{create_router, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.tracing_config())?;
    info!(model = ?config.model_path, device = %config.device, "Starting");

    // A model that fails to load stops the process before it serves anything.
    let resources = Arc::new(load_resources(&config)?);

    let shutdown = GracefulShutdown::new();
    shutdown.listen_for_signals();

    let state = Arc::new(AppState::new(
        resources,
        config.max_concurrent_sessions,
        config.max_concurrent_batches,
        config.session_idle_timeout,
        shutdown.clone(),
    ));
    let live_sessions = state.metrics.active_sessions_counter();
    let app = create_router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.triggered().await })
        .await?;

    let remaining = drain_sessions(live_sessions, config.shutdown_grace_period).await;
    if remaining > 0 {
        warn!(remaining, "Exiting with sessions still open");
    }
    info!("Server stopped");
    Ok(())
}
