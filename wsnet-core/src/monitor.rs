//! Periodic eviction of idle connections from the [`ConnectionTracker`].

use crate::tracker::ConnectionTracker;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsnet_common::{HeartbeatConfig, Result};

pub struct ConnectionMonitor {
    tracker: ConnectionTracker,
    config: HeartbeatConfig,
}

impl ConnectionMonitor {
    pub fn new(tracker: ConnectionTracker, config: HeartbeatConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { tracker, config })
    }

    /// Run one sweep. Returns the number of evicted connections.
    pub fn sweep(&self) -> usize {
        let removed = self.tracker.remove_stale(self.config.timeout);
        if removed > 0 {
            info!(removed, remaining = self.tracker.count(), "Evicted stale connections");
        }
        removed
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; nothing can be stale yet
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Connection monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }
}
