//! Registration orchestrator
//!
//! Drives one registration from enqueue to session or timeout. A match that
//! commits before the timeout cleanup has removed the queue row is always
//! returned to the caller.

use crate::config::MatchmakingSettings;
use crate::error::{MatchmakingError, Result};
use crate::metrics::{MetricsCollector, RegistrationOutcome};
use crate::queue::QueueStore;
use crate::registry::WaiterRegistry;
use crate::types::{Player, PlayerId, Session};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Coordinates enqueue, delivery handle and deadline for each registration
pub struct RegistrationOrchestrator {
    store: Arc<dyn QueueStore>,
    registry: Arc<WaiterRegistry>,
    wait_timeout: Duration,
    delivery_grace: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RegistrationOrchestrator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<WaiterRegistry>,
        settings: &MatchmakingSettings,
    ) -> Self {
        Self {
            store,
            registry,
            wait_timeout: settings.wait_timeout(),
            delivery_grace: settings.delivery_grace(),
            metrics: None,
        }
    }

    /// Report registration outcomes to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Queue `player` and wait until it is paired or the deadline passes.
    ///
    /// Fails with `DuplicateEntry` if the player is already queued and with
    /// `Timeout` if no match was committed in time. If the returned future is
    /// dropped the registration is withdrawn.
    pub async fn register_and_wait(&self, player: Player) -> Result<Session> {
        let started = Instant::now();
        let result = self.register_inner(&player).await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => RegistrationOutcome::Matched,
                Err(MatchmakingError::DuplicateEntry { .. }) => RegistrationOutcome::Conflict,
                Err(MatchmakingError::Timeout { .. }) => RegistrationOutcome::Timeout,
                Err(_) => RegistrationOutcome::Failed,
            };
            metrics.record_registration(outcome, started.elapsed());
        }

        result
    }

    async fn register_inner(&self, player: &Player) -> Result<Session> {
        player.validate()?;

        let registered_at = current_timestamp();
        self.store.enqueue(player).await?;
        debug!(
            "Player '{}' queued - rating: {}, deadline: {}s",
            player.id,
            player.rating,
            self.wait_timeout.as_secs()
        );

        let handle = match self.registry.register(&player.id) {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "Waiter already registered for queued player '{}': {}",
                    player.id, e
                );
                let ids = vec![player.id.clone()];
                if let Err(cleanup_err) = self.store.dequeue_many(&ids).await {
                    warn!(
                        "Failed to dequeue player '{}' after registry conflict: {}",
                        player.id, cleanup_err
                    );
                }
                return Err(e);
            }
        };

        let mut pending = PendingRegistration::new(
            self.store.clone(),
            self.registry.clone(),
            player.id.clone(),
        );
        let mut receiver = handle.into_receiver();

        match timeout(self.wait_timeout, &mut receiver).await {
            Ok(delivered) => {
                pending.disarm();
                return delivered.map_err(|_| delivery_closed(&player.id));
            }
            Err(_) => {
                debug!(
                    "Deadline reached for player '{}' - cleaning up",
                    player.id
                );
            }
        }

        let result = self
            .resolve_deadline(&player.id, registered_at, &mut receiver)
            .await;
        pending.disarm();
        result
    }

    /// Decide between timeout and a match that raced the deadline.
    ///
    /// The delete below waits behind any matching transaction holding the
    /// row. If it removes the row nobody matched the player. If the row is
    /// already gone the match has committed: its session is read back from
    /// storage, since delivery misses players paired before their handle
    /// was registered.
    async fn resolve_deadline(
        &self,
        player_id: &str,
        registered_at: DateTime<Utc>,
        receiver: &mut oneshot::Receiver<Session>,
    ) -> Result<Session> {
        let ids = vec![player_id.to_string()];

        match self.store.dequeue_many(&ids).await {
            Ok(0) => {
                if let Ok(session) = receiver.try_recv() {
                    return Ok(session);
                }
                if let Some(session) = self.persisted_session(player_id, registered_at).await {
                    self.registry.unregister(player_id);
                    info!(
                        "Player '{}' matched without delivery - session: {}",
                        player_id, session.session_id
                    );
                    return Ok(session);
                }
                debug!(
                    "Player '{}' was matched during the deadline - waiting for delivery",
                    player_id
                );
            }
            Ok(_) => {
                self.registry.unregister(player_id);
                return self.honor_late_delivery(player_id, receiver);
            }
            Err(e) => {
                error!(
                    "Failed to remove timed-out player '{}' from queue: {}",
                    player_id, e
                );
                self.registry.unregister(player_id);
                return self.honor_late_delivery(player_id, receiver);
            }
        }

        match timeout(self.delivery_grace, &mut *receiver).await {
            Ok(Ok(session)) => {
                info!(
                    "Player '{}' matched at the deadline - session: {}",
                    player_id, session.session_id
                );
                Ok(session)
            }
            Ok(Err(_)) => Err(delivery_closed(player_id)),
            Err(_) => {
                warn!(
                    "Player '{}' left the queue but no session arrived within {}ms",
                    player_id,
                    self.delivery_grace.as_millis()
                );
                self.registry.unregister(player_id);
                self.honor_late_delivery(player_id, receiver)
            }
        }
    }

    async fn persisted_session(
        &self,
        player_id: &str,
        registered_at: DateTime<Utc>,
    ) -> Option<Session> {
        match self
            .store
            .find_session_for_player(player_id, registered_at)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "Failed to look up session for player '{}': {}",
                    player_id, e
                );
                None
            }
        }
    }

    /// After unregistering, pick up a session that was delivered first
    fn honor_late_delivery(
        &self,
        player_id: &str,
        receiver: &mut oneshot::Receiver<Session>,
    ) -> Result<Session> {
        match receiver.try_recv() {
            Ok(session) => Ok(session),
            Err(_) => {
                info!(
                    "Player '{}' timed out after {}s without a match",
                    player_id,
                    self.wait_timeout.as_secs()
                );
                Err(MatchmakingError::Timeout {
                    player_id: player_id.to_string(),
                    waited_seconds: self.wait_timeout.as_secs(),
                })
            }
        }
    }
}

fn delivery_closed(player_id: &str) -> MatchmakingError {
    MatchmakingError::InternalError {
        message: format!("delivery handle for player '{}' closed without a session", player_id),
    }
}

/// Withdraws a registration whose future was dropped before it resolved
struct PendingRegistration {
    store: Arc<dyn QueueStore>,
    registry: Arc<WaiterRegistry>,
    player_id: PlayerId,
    armed: bool,
}

impl PendingRegistration {
    fn new(store: Arc<dyn QueueStore>, registry: Arc<WaiterRegistry>, player_id: PlayerId) -> Self {
        Self {
            store,
            registry,
            player_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRegistration {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.registry.unregister(&self.player_id);

        let store = self.store.clone();
        let player_id = self.player_id.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let ids = vec![player_id.clone()];
                    match store.dequeue_many(&ids).await {
                        Ok(removed) => debug!(
                            "Withdrew abandoned registration for player '{}' (removed: {})",
                            player_id, removed
                        ),
                        Err(e) => warn!(
                            "Failed to withdraw abandoned registration for player '{}': {}",
                            player_id, e
                        ),
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to withdraw abandoned registration for player '{}'",
                player_id
            ),
        }
    }
}
