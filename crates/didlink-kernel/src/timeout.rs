//! Timeout monitor: periodically abandons records that outstayed their
//! state's dwell limit.

use crate::connections::ConnectionManager;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Sweep `manager` every `interval` until `shutdown` flips or the manager
/// is dropped.
pub fn spawn_timeout_monitor(
    manager: &Arc<ConnectionManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let manager: Weak<ConnectionManager> = Arc::downgrade(manager);
    info!(interval_ms = interval.as_millis() as u64, "Starting timeout monitor");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("Timeout monitor: shutdown signal received");
                    break;
                }
            }

            let Some(manager) = manager.upgrade() else {
                debug!("Timeout monitor: connection manager dropped");
                break;
            };
            let expired = manager.sweep_timeouts().await;
            if !expired.is_empty() {
                debug!(count = expired.len(), "Timeout monitor: records abandoned");
            }
        }
    })
}
