use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use clinicq::config::Config;
use clinicq::engine::Engine;
use clinicq::store::WalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    clinicq::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(WalStore::open(&config.wal_path())?);
    let engine = Arc::new(Engine::new(store.clone(), config.lock_timeout));

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    let compactor = tokio::spawn(async move {
        clinicq::compactor::run_compactor(compactor_store, threshold).await;
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("clinicq listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  compact_threshold: {threshold}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received, draining requests");
    };

    axum::serve(listener, clinicq::api::router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;

    compactor.abort();
    store.close().await?;
    info!("clinicq stopped");
    Ok(())
}
