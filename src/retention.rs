use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{error, info, span, Level};

use crate::store::Store;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    pub delete_after_days: i64,
    pub sweep_interval_secs: u64,
}

/// Periodic sweep deleting readings older than the retention window.
pub async fn task(store: Store, cfg: RetentionConfig) {
    let span = span!(Level::INFO, "Retention");
    let _enter = span.enter();

    let window = SignedDuration::from_hours(cfg.delete_after_days * 24);
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.sweep_interval_secs));
    loop {
        interval.tick().await;
        let threshold = Timestamp::now() - window;
        match store.delete_states_before(threshold).await {
            Ok(0) => {}
            Ok(deleted) => info!("deleted {deleted} readings older than {threshold}"),
            Err(e) => error!("retention sweep failed: {e}"),
        }
    }
}
