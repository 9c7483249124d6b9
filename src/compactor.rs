use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::limits::COMPACT_CHECK_INTERVAL_SECS;
use crate::store::WalStore;

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(COMPACT_CHECK_INTERVAL_SECS));
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Compact when at least `threshold` appends happened since the last one.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("WAL compacted after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
