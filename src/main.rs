use std::sync::Arc;

use tracing::info;

use salas::blob::FsBlobStore;
use salas::config::Config;
use salas::engine::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    salas::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let blobs = Arc::new(FsBlobStore::new(config.blob_dir())?);
    let engine = Arc::new(Engine::new(config.wal_path(), config.calendar(), blobs)?);

    info!("salasd started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  peak band: {}-{}h", config.peak.start_hour, config.peak.end_hour);
    info!("  rooms: {}", engine.list_rooms().await.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(salas::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c: stop the compactor, then leave a compact log behind.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
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
    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("salasd stopped");
    Ok(())
}
