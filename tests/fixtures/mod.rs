//! Test fixtures and fake implementations for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duel_room::config::MatchmakingSettings;
use duel_room::error::{MatchmakingError, Result};
use duel_room::matching::MatchingProcessor;
use duel_room::orchestrator::RegistrationOrchestrator;
use duel_room::queue::{InMemoryQueueStore, QueueStore, QueueTransaction};
use duel_room::registry::WaiterRegistry;
use duel_room::types::{Player, PlayerId, QueueEntry, Session};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Queue store wrapper whose operations can be made to fail on demand
#[derive(Debug, Clone, Default)]
pub struct FlakyQueueStore {
    inner: InMemoryQueueStore,
    fail_begin: Arc<AtomicBool>,
    fail_insert_session: Arc<AtomicBool>,
    fail_ping: Arc<AtomicBool>,
    begin_calls: Arc<AtomicUsize>,
    enqueue_ack_delay_ms: Arc<AtomicU64>,
}

impl FlakyQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryQueueStore {
        &self.inner
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert_session(&self, fail: bool) {
        self.fail_insert_session.store(fail, Ordering::SeqCst);
    }

    pub fn fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Hold `enqueue` results back after the row is stored
    pub fn delay_enqueue_ack(&self, delay: Duration) {
        self.enqueue_ack_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of matching transactions opened so far
    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    fn injected(what: &str) -> MatchmakingError {
        MatchmakingError::StorageFailure {
            message: format!("injected {} failure", what),
        }
    }
}

#[async_trait]
impl QueueStore for FlakyQueueStore {
    async fn enqueue(&self, player: &Player) -> Result<QueueEntry> {
        let entry = self.inner.enqueue(player).await?;
        let delay = self.enqueue_ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(entry)
    }

    async fn dequeue_many(&self, player_ids: &[PlayerId]) -> Result<u64> {
        self.inner.dequeue_many(player_ids).await
    }

    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(Self::injected("begin"));
        }

        let inner = self.inner.begin().await?;
        Ok(Box::new(FlakyTransaction {
            inner,
            fail_insert_session: self.fail_insert_session.clone(),
        }))
    }

    async fn waiting_players(&self) -> Result<Vec<QueueEntry>> {
        self.inner.waiting_players().await
    }

    async fn expire_older_than(&self, max_age: Duration) -> Result<Vec<PlayerId>> {
        self.inner.expire_older_than(max_age).await
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.inner.find_session(session_id).await
    }

    async fn find_session_for_player(
        &self,
        player_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        self.inner.find_session_for_player(player_id, since).await
    }

    async fn sessions(&self) -> Result<Vec<Session>> {
        self.inner.sessions().await
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(Self::injected("ping"));
        }
        self.inner.ping().await
    }
}

struct FlakyTransaction {
    inner: Box<dyn QueueTransaction>,
    fail_insert_session: Arc<AtomicBool>,
}

#[async_trait]
impl QueueTransaction for FlakyTransaction {
    async fn snapshot_ordered_for_update(&mut self) -> Result<Vec<QueueEntry>> {
        self.inner.snapshot_ordered_for_update().await
    }

    async fn dequeue_many(&mut self, player_ids: &[PlayerId]) -> Result<u64> {
        self.inner.dequeue_many(player_ids).await
    }

    async fn insert_session(&mut self, session: &Session) -> Result<()> {
        if self.fail_insert_session.load(Ordering::SeqCst) {
            return Err(FlakyQueueStore::injected("session insert"));
        }
        self.inner.insert_session(session).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

/// Matchmaking settings with a short tick for tests
pub fn test_settings() -> MatchmakingSettings {
    MatchmakingSettings {
        tick_interval_ms: 100,
        ..Default::default()
    }
}

/// Core components wired together over one store
pub struct TestSystem {
    pub store: Arc<dyn QueueStore>,
    pub registry: Arc<WaiterRegistry>,
    pub processor: Arc<MatchingProcessor>,
    pub orchestrator: Arc<RegistrationOrchestrator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestSystem {
    pub fn new(store: Arc<dyn QueueStore>, settings: &MatchmakingSettings) -> Self {
        let registry = Arc::new(WaiterRegistry::new());
        let processor = Arc::new(MatchingProcessor::new(
            store.clone(),
            registry.clone(),
            settings,
        ));
        let orchestrator = Arc::new(RegistrationOrchestrator::new(
            store.clone(),
            registry.clone(),
            settings,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            store,
            registry,
            processor,
            orchestrator,
            shutdown_tx,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryQueueStore::new()), &test_settings())
    }

    /// Run the matching loop in the background
    pub fn start_matcher(&self) -> JoinHandle<()> {
        tokio::spawn(self.processor.clone().run(self.shutdown_tx.subscribe()))
    }

    pub async fn stop_matcher(&self, handle: JoinHandle<()>) {
        let _ = self.shutdown_tx.send(());
        handle.await.expect("matcher task panicked");
    }

    /// Register a player on a separate task
    pub fn register(&self, id: &str, rating: i64) -> JoinHandle<Result<Session>> {
        let orchestrator = self.orchestrator.clone();
        let player = Player::new(id, rating);
        tokio::spawn(async move { orchestrator.register_and_wait(player).await })
    }

    pub async fn waiting_ids(&self) -> Vec<String> {
        self.store
            .waiting_players()
            .await
            .expect("queue readable")
            .into_iter()
            .map(|e| e.player.id)
            .collect()
    }

    /// Wait until `count` registrations hold a delivery handle
    pub async fn wait_for_waiters(&self, count: usize) {
        while self.registry.len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
