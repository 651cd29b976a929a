//! Background idle-sandbox reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::SandboxManager;

/// Spawn the periodic reaper. Abort the returned handle on shutdown.
pub fn spawn_reaper(
    manager: Arc<SandboxManager>,
    interval: Duration,
    idle_ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh process
        // does not reap sandboxes created during startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = manager.reap_idle(idle_ttl).await;
            if !evicted.is_empty() {
                tracing::debug!(count = evicted.len(), "reaper evicted idle sandboxes");
            }
        }
    })
}
