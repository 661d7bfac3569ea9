use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::RoomRegistry;
use crate::metrics;

/// Runs [`sweep`] every `interval` until the handle is aborted.
pub fn spawn_idle_reaper(registry: Arc<RoomRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset(); // skip immediate first tick

        loop {
            ticker.tick().await;
            sweep(&registry).await;
        }
    })
}

/// Deletes idle rooms and expired durable lists. Returns the number of
/// rooms removed.
pub async fn sweep(registry: &RoomRegistry) -> usize {
    let reaped = registry.reap_idle(Instant::now()).await;
    for doc_id in &reaped {
        info!(doc_id = %doc_id, "reaped idle room");
    }
    metrics::record_rooms_reaped(reaped.len());

    match registry.store().purge_expired().await {
        Ok(0) => {}
        Ok(purged) => debug!(purged, "purged expired fragment lists"),
        Err(error) => warn!(error = %error, "failed to purge expired fragment lists"),
    }

    reaped.len()
}
