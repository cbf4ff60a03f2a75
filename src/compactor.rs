use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::registry::SlotRegistry;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` events have been
/// appended since the last compaction.
pub async fn run_compactor(registry: Arc<SlotRegistry>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&registry, threshold).await;
    }
}

/// One compactor pass. Returns true when the log was rewritten.
pub async fn compact_if_needed(registry: &SlotRegistry, threshold: u64) -> bool {
    let appended = match registry.appends_since_compact().await {
        Ok(n) => n,
        Err(e) => {
            error!("compactor: {e}");
            return false;
        }
    };
    if threshold == 0 || appended < threshold {
        return false;
    }
    match registry.compact().await {
        Ok(kept) => {
            info!("compacted {} ({appended} appends -> {kept} events)", registry.wal_path().display());
            true
        }
        Err(e) => {
            error!("compaction of {} failed: {e}", registry.wal_path().display());
            false
        }
    }
}
