use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use offline_access::config::Config;
use offline_access::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let state = AppState::new(&config).await?;
    tracing::info!("✅ AppState initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = state.worker.clone();
    let worker_shutdown = shutdown_rx.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let sweeper = state.sweeper.clone();
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    tracing::info!("✅ All systems operational");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining in-flight jobs...");
    shutdown_tx.send(true)?;

    let (worker_result, sweeper_result) = tokio::join!(worker_task, sweeper_task);
    worker_result?;
    sweeper_result?;

    if state.audit.dropped_total() > 0 {
        tracing::warn!(dropped = state.audit.dropped_total(), "Audit records were dropped");
    }
    tracing::info!("👋 Shutdown complete");
    Ok(())
}
