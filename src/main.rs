use axum::middleware::from_fn_with_state;
use estate_guard::security::{admission_middleware, stats_router};
use estate_guard::GuardConfig;
use std::net::SocketAddr;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = GuardConfig::from_env()?;

    // Initialize structured logging, RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        max_requests = config.adaptive.base_max_requests,
        min_max_requests = config.adaptive.min_max_requests,
        max_max_requests = config.adaptive.max_max_requests,
        window_secs = config.rate_limiter.window.as_secs(),
        refill_policy = ?config.rate_limiter.refill_policy,
        "Starting admission gate"
    );

    let gate = config.build_gate()?;
    gate.limiter.start();
    gate.metrics.start();

    let app = stats_router(gate.clone())
        .layer(from_fn_with_state(gate.clone(), admission_middleware));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Server starting on http://{}", addr);
    tracing::info!("  GET /health           - Health check");
    tracing::info!("  GET /admission/stats  - Limiter, load and security metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gate.shutdown();
    tracing::info!("Admission gate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
