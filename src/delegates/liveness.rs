//! Liveness monitor: periodically marks silent delegates down.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::registry::DelegateRegistry;

/// Spawn the liveness background loop.
///
/// Every `interval`, delegates whose last heartbeat is older than
/// `max_heartbeat_age` are flipped to disconnected. The first tick fires
/// immediately.
pub fn spawn_liveness_monitor(
    registry: Arc<DelegateRegistry>,
    interval: Duration,
    max_heartbeat_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_heartbeat_age_secs = max_heartbeat_age.as_secs(),
            "Liveness monitor started"
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            match registry.mark_down_delegates(max_heartbeat_age).await {
                Ok(down) if !down.is_empty() => {
                    info!(count = down.len(), "Delegates marked down");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Liveness sweep failed"),
            }
        }
    })
}
