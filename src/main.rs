use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use studio_book::config::Config;
use studio_book::directory::{InMemoryCatalog, InMemoryDirectory};
use studio_book::engine::Engine;
use studio_book::reaper;

const COMPACTOR_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    studio_book::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // The identity service and catalog are external; the daemon runs with
    // in-memory stand-ins until they are wired in.
    let engine = Arc::new(Engine::open(
        &config.wal_path(),
        Arc::new(InMemoryDirectory::new()),
        Arc::new(InMemoryCatalog::new()),
        config.hours,
    )?);

    info!("studiod started");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  hours: {:02}:00-{:02}:00, {} min slots, offset {}",
        config.hours.open_hour(),
        config.hours.close_hour(),
        config.hours.slot_minutes(),
        config.hours.utc_offset()
    );
    info!("  reaper every {:?}, compaction after {} appends", config.reaper_interval, config.compact_threshold);
    info!(
        "  metrics: {}",
        config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let reaper_task = tokio::spawn(reaper::run_reaper(engine.clone(), config.reaper_interval));
    let compactor_task = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACTOR_PERIOD,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    info!("shutdown signal received");

    reaper_task.abort();
    compactor_task.abort();
    // Leave a compact log behind; every commit is already durable.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("studiod stopped");
    Ok(())
}
