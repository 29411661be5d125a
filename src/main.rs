use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use carhold::clock::SystemClock;
use carhold::config::Config;
use carhold::notify::NotifyHub;
use carhold::{reaper, Engine};

/// Maintenance daemon: owns the ledger file, sweeps holds and stale checkouts,
/// compacts the WAL, and forwards notices to the log as JSON for the dispatcher.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    carhold::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        notify.clone(),
        Arc::new(SystemClock),
    )?);

    info!("carhold started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  hold_ttl: {}m", config.hold_ttl.num_minutes());
    info!("  stale_after: {}m", config.stale_after().num_minutes());
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let reaper = tokio::spawn(reaper::run_reaper(
        engine.clone(),
        config.sweep_interval,
        config.stale_after(),
    ));
    let compactor = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_check_interval,
    ));
    let mut notices = notify.subscribe_all();
    let forwarder = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => info!(target: "carhold::notice", "{}", notice.to_json()),
                Err(RecvError::Lagged(n)) => tracing::warn!("notice forwarder lagged by {n}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    reaper.abort();
    compactor.abort();
    forwarder.abort();

    if let Err(e) = engine.compact_wal().await {
        tracing::error!("final compaction failed: {e}");
    }
    info!("carhold stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
