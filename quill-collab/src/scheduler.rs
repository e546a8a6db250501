//! Periodic snapshots of dirty sessions.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::SessionRegistry;

/// Background task snapshotting every modified document on a fixed interval.
pub struct SnapshotScheduler;

impl SnapshotScheduler {
    /// Start the scheduler. Returns `None` for a zero interval (disabled).
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            log::info!("Periodic snapshots disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let written = registry.snapshot_dirty().await;
                if written > 0 {
                    log::info!("Periodic snapshot: {written} documents written");
                }
            }
        }))
    }
}
