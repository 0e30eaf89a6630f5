//! Matching processor
//!
//! Each tick opens one queue transaction, locks the ordered snapshot, pairs
//! the earliest waiters in arrival order, removes them and persists their
//! sessions. Sessions are handed to the waiting registrations only after the
//! transaction commits.

use crate::config::MatchmakingSettings;
use crate::error::{MatchmakingError, Result};
use crate::metrics::{MetricsCollector, TickOutcome};
use crate::queue::{QueueStore, QueueTransaction};
use crate::registry::WaiterRegistry;
use crate::session::SessionFactory;
use crate::types::{QueueEntry, Session};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Counters kept by the processor
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchingStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    /// Failed ticks since the last successful one
    pub consecutive_failures: u64,
    pub sessions_created: u64,
    pub undelivered: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Background pairing loop over a queue store
pub struct MatchingProcessor {
    store: Arc<dyn QueueStore>,
    registry: Arc<WaiterRegistry>,
    factory: SessionFactory,
    tick_interval: Duration,
    max_pairs_per_tick: usize,
    metrics: Option<Arc<MetricsCollector>>,
    stats: RwLock<MatchingStats>,
}

impl MatchingProcessor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<WaiterRegistry>,
        settings: &MatchmakingSettings,
    ) -> Self {
        Self {
            store,
            registry,
            factory: SessionFactory::new(),
            tick_interval: settings.tick_interval(),
            max_pairs_per_tick: settings.max_pairs_per_tick.max(1),
            metrics: None,
            stats: RwLock::new(MatchingStats::default()),
        }
    }

    /// Report tick outcomes to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Get current processor statistics
    pub fn stats(&self) -> Result<MatchingStats> {
        let stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire stats lock".to_string(),
            })?;

        Ok(stats.clone())
    }

    /// Run a single matching pass.
    ///
    /// Returns the sessions committed by this pass. On error the transaction
    /// has been rolled back and the queue is unchanged.
    pub async fn run_tick(&self) -> Result<Vec<Session>> {
        let started = Instant::now();
        let result = self.match_and_commit().await;
        let elapsed = started.elapsed();

        match &result {
            Ok(sessions) => {
                let undelivered = self.deliver_all(sessions);
                self.record(sessions.len(), undelivered, None);

                if let Some(metrics) = &self.metrics {
                    let outcome = if sessions.is_empty() {
                        TickOutcome::Idle
                    } else {
                        TickOutcome::Matched
                    };
                    metrics.record_tick(outcome, sessions.len(), elapsed);
                    metrics.record_undelivered(undelivered);
                }
            }
            Err(e) => {
                self.record(0, 0, Some(e.to_string()));
                if let Some(metrics) = &self.metrics {
                    metrics.record_tick(TickOutcome::Failed, 0, elapsed);
                }
            }
        }

        result
    }

    async fn match_and_commit(&self) -> Result<Vec<Session>> {
        let mut tx = self.store.begin().await?;

        let sessions = match self.pair_waiting(&mut *tx).await {
            Ok(sessions) => sessions,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed matching pass failed: {}", rollback_err);
                }
                return Err(e);
            }
        };

        tx.commit().await?;
        Ok(sessions)
    }

    /// Pair consecutive FIFO entries inside `tx`
    async fn pair_waiting(&self, tx: &mut dyn QueueTransaction) -> Result<Vec<Session>> {
        let snapshot = tx.snapshot_ordered_for_update().await?;
        if snapshot.len() < 2 {
            debug!("Matching tick - waiting: {}, nothing to pair", snapshot.len());
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for pair in snapshot.chunks_exact(2).take(self.max_pairs_per_tick) {
            let session = self.pair(tx, &pair[0], &pair[1]).await?;
            sessions.push(session);
        }

        Ok(sessions)
    }

    async fn pair(
        &self,
        tx: &mut dyn QueueTransaction,
        first: &QueueEntry,
        second: &QueueEntry,
    ) -> Result<Session> {
        let session = self
            .factory
            .create(first.player.clone(), second.player.clone());

        let ids = vec![first.player.id.clone(), second.player.id.clone()];
        let removed = tx.dequeue_many(&ids).await?;
        if removed != 2 {
            return Err(MatchmakingError::StorageFailure {
                message: format!(
                    "expected to dequeue 2 locked entries for {} and {}, removed {}",
                    first.player.id, second.player.id, removed
                ),
            });
        }

        tx.insert_session(&session).await?;
        Ok(session)
    }

    /// Hand committed sessions to both players, returning how many
    /// deliveries found no live waiter
    fn deliver_all(&self, sessions: &[Session]) -> u64 {
        let mut undelivered = 0;

        for session in sessions {
            info!(
                "Match created - session: {}, player1: '{}' ({}), player2: '{}' ({})",
                session.session_id,
                session.player1.id,
                session.player1.rating,
                session.player2.id,
                session.player2.rating
            );

            for player_id in [&session.player1.id, &session.player2.id] {
                if !self.registry.deliver(player_id, session.clone()) {
                    warn!(
                        "Session {} not delivered to player '{}' - no waiting registration",
                        session.session_id, player_id
                    );
                    undelivered += 1;
                }
            }
        }

        undelivered
    }

    fn record(&self, sessions: usize, undelivered: u64, error: Option<String>) {
        let mut stats = match self.stats.write() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };

        stats.ticks += 1;
        stats.sessions_created += sessions as u64;
        stats.undelivered += undelivered;
        stats.last_tick_at = Some(current_timestamp());
        if error.is_some() {
            stats.failed_ticks += 1;
            stats.consecutive_failures += 1;
            stats.last_error = error;
        } else {
            stats.consecutive_failures = 0;
        }
    }

    /// Tick until `shutdown` fires.
    ///
    /// Ticks never overlap; a failed tick is logged and the loop continues.
    /// Shutdown drops an in-flight tick, which rolls its transaction back.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Matching processor started - interval: {}ms, max pairs per tick: {}",
            self.tick_interval.as_millis(),
            self.max_pairs_per_tick
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Matching processor stopping");
                    break;
                }
                result = async {
                    ticker.tick().await;
                    self.run_tick().await
                } => {
                    if let Err(e) = result {
                        error!("Matching tick failed: {}", e);
                    }
                }
            }
        }
    }
}
