//! Queue reaper
//!
//! Removes queue entries nobody is waiting on any more, such as rows left
//! behind when the process restarted while players were queued.

use crate::config::MatchmakingSettings;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::queue::QueueStore;
use crate::types::PlayerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct QueueReaper {
    store: Arc<dyn QueueStore>,
    max_age: Duration,
    cleanup_interval: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QueueReaper {
    pub fn new(store: Arc<dyn QueueStore>, settings: &MatchmakingSettings) -> Self {
        Self {
            store,
            max_age: settings.stale_entry_age(),
            cleanup_interval: settings.cleanup_interval(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delete entries that have waited longer than the configured age
    pub async fn run_expiry_pass(&self) -> Result<Vec<PlayerId>> {
        let expired = self.store.expire_older_than(self.max_age).await?;

        if expired.is_empty() {
            debug!(
                "Queue reaper pass - nothing older than {}s",
                self.max_age.as_secs()
            );
        } else {
            info!(
                "Expired {} stale queue entries older than {}s: {:?}",
                expired.len(),
                self.max_age.as_secs(),
                expired
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_expired(expired.len());
        }

        Ok(expired)
    }

    /// Run expiry passes until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Queue reaper started - interval: {}s, max age: {}s",
            self.cleanup_interval.as_secs(),
            self.max_age.as_secs()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Queue reaper stopping");
                    break;
                }
                result = async {
                    ticker.tick().await;
                    self.run_expiry_pass().await
                } => {
                    if let Err(e) = result {
                        error!("Error during queue cleanup: {}", e);
                    }
                }
            }
        }
    }
}
