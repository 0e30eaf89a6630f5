//! In-memory queue store
//!
//! Keeps the queue and session table behind a single async mutex. A
//! transaction holds that mutex for its whole lifetime, so it locks every row
//! at once: anything that wants to touch the queue while a matching pass is
//! running waits for it to commit or roll back. Nothing survives a restart.

use crate::error::{MatchmakingError, Result};
use crate::queue::store::{QueueStore, QueueTransaction};
use crate::types::{Player, PlayerId, QueueEntry, Session};
use crate::utils::{current_timestamp, to_chrono_duration};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    /// Entries in insertion order
    entries: Vec<QueueEntry>,
    sessions: Vec<Session>,
    next_sequence: u64,
    last_enqueued_at: Option<DateTime<Utc>>,
}

impl QueueState {
    fn contains(&self, player_id: &str) -> bool {
        self.entries.iter().any(|e| e.player.id == player_id)
    }

    fn ordered(&self) -> Vec<QueueEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        entries
    }

    fn remove(&mut self, player_ids: &[PlayerId]) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|e| !player_ids.contains(&e.player.id));
        (before - self.entries.len()) as u64
    }

    fn has_session(&self, session_id: &str) -> bool {
        self.sessions.iter().any(|s| s.session_id == session_id)
    }
}

/// Queue store that lives in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, player: &Player) -> Result<QueueEntry> {
        let mut state = self.state.lock().await;

        if state.contains(&player.id) {
            return Err(MatchmakingError::DuplicateEntry {
                player_id: player.id.clone(),
            });
        }

        // Never let a wall-clock step backwards reorder the queue
        let now = current_timestamp();
        let enqueued_at = match state.last_enqueued_at {
            Some(last) if last > now => last,
            _ => now,
        };

        let entry = QueueEntry {
            player: player.clone(),
            enqueued_at,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;
        state.last_enqueued_at = Some(enqueued_at);
        state.entries.push(entry.clone());

        debug!(
            "Enqueued player '{}' (seq {}) - waiting: {}",
            player.id,
            entry.sequence,
            state.entries.len()
        );
        Ok(entry)
    }

    async fn dequeue_many(&self, player_ids: &[PlayerId]) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(state.remove(player_ids))
    }

    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            guard,
            removed: Vec::new(),
            new_sessions: Vec::new(),
        }))
    }

    async fn waiting_players(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.state.lock().await.ordered())
    }

    async fn expire_older_than(&self, max_age: Duration) -> Result<Vec<PlayerId>> {
        let cutoff = current_timestamp()
            .checked_sub_signed(to_chrono_duration(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut state = self.state.lock().await;
        let expired: Vec<PlayerId> = state
            .entries
            .iter()
            .filter(|e| e.enqueued_at < cutoff)
            .map(|e| e.player.id.clone())
            .collect();
        state.remove(&expired);
        Ok(expired)
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn find_session_for_player(
        &self,
        player_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.includes(player_id) && s.start_time >= since)
            .max_by_key(|s| s.start_time)
            .cloned())
    }

    async fn sessions(&self) -> Result<Vec<Session>> {
        Ok(self.state.lock().await.sessions.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Transaction over the in-memory store.
///
/// Changes are staged and only applied to the shared state on commit.
struct InMemoryTransaction {
    guard: OwnedMutexGuard<QueueState>,
    removed: Vec<PlayerId>,
    new_sessions: Vec<Session>,
}

#[async_trait]
impl QueueTransaction for InMemoryTransaction {
    async fn snapshot_ordered_for_update(&mut self) -> Result<Vec<QueueEntry>> {
        let removed = &self.removed;
        Ok(self
            .guard
            .ordered()
            .into_iter()
            .filter(|e| !removed.contains(&e.player.id))
            .collect())
    }

    async fn dequeue_many(&mut self, player_ids: &[PlayerId]) -> Result<u64> {
        let mut count = 0;
        for player_id in player_ids {
            if self.guard.contains(player_id) && !self.removed.contains(player_id) {
                self.removed.push(player_id.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_session(&mut self, session: &Session) -> Result<()> {
        let exists = self.guard.has_session(&session.session_id)
            || self
                .new_sessions
                .iter()
                .any(|s| s.session_id == session.session_id);
        if exists {
            return Err(MatchmakingError::StorageFailure {
                message: format!("session {} already exists", session.session_id),
            });
        }

        self.new_sessions.push(session.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            mut guard,
            removed,
            new_sessions,
        } = *self;

        guard.remove(&removed);
        guard.sessions.extend(new_sessions);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionFactory;
    use std::time::Duration;

    fn ids(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.player.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate() {
        let store = InMemoryQueueStore::new();

        store.enqueue(&Player::new("a1", 1000)).await.unwrap();
        let err = store.enqueue(&Player::new("a1", 1500)).await.unwrap_err();

        assert!(matches!(err, MatchmakingError::DuplicateEntry { ref player_id } if player_id == "a1"));
        assert_eq!(store.waiting_players().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_players_in_arrival_order() {
        let store = InMemoryQueueStore::new();
        for id in ["a1", "b1", "c1", "d1"] {
            store.enqueue(&Player::new(id, 1000)).await.unwrap();
        }

        let waiting = store.waiting_players().await.unwrap();
        assert_eq!(ids(&waiting), vec!["a1", "b1", "c1", "d1"]);
        assert!(waiting.windows(2).all(|w| w[0].enqueued_at <= w[1].enqueued_at));
        assert!(waiting.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_dequeue_is_idempotent() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();

        let ids = vec!["a1".to_string(), "ghost".to_string()];
        assert_eq!(store.dequeue_many(&ids).await.unwrap(), 1);
        assert_eq!(store.dequeue_many(&ids).await.unwrap(), 0);
        assert!(store.waiting_players().await.unwrap().is_empty());

        // A removed player can queue again
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_commit_applies_changes() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();
        store.enqueue(&Player::new("b1", 1200)).await.unwrap();
        store.enqueue(&Player::new("c1", 900)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let snapshot = tx.snapshot_ordered_for_update().await.unwrap();
        assert_eq!(ids(&snapshot), vec!["a1", "b1", "c1"]);

        let session = SessionFactory::new()
            .create(snapshot[0].player.clone(), snapshot[1].player.clone());
        let pair = vec!["a1".to_string(), "b1".to_string()];
        assert_eq!(tx.dequeue_many(&pair).await.unwrap(), 2);
        assert_eq!(tx.dequeue_many(&pair).await.unwrap(), 0);
        assert_eq!(
            ids(&tx.snapshot_ordered_for_update().await.unwrap()),
            vec!["c1"]
        );
        tx.insert_session(&session).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ids(&store.waiting_players().await.unwrap()), vec!["c1"]);
        let stored = store.find_session(&session.session_id).await.unwrap();
        assert_eq!(stored, Some(session));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();
        store.enqueue(&Player::new("b1", 1200)).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.snapshot_ordered_for_update().await.unwrap();
            let session = SessionFactory::new()
                .create(Player::new("a1", 1000), Player::new("b1", 1200));
            tx.dequeue_many(&["a1".to_string(), "b1".to_string()])
                .await
                .unwrap();
            tx.insert_session(&session).await.unwrap();
        }

        assert_eq!(store.waiting_players().await.unwrap().len(), 2);
        assert!(store.sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_id_rejected() {
        let store = InMemoryQueueStore::new();
        let session =
            SessionFactory::new().create(Player::new("a1", 1000), Player::new("b1", 1200));

        let mut tx = store.begin().await.unwrap();
        tx.insert_session(&session).await.unwrap();
        let err = tx.insert_session(&session).await.unwrap_err();
        assert!(matches!(err, MatchmakingError::StorageFailure { .. }));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_open_transaction() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();
        store.enqueue(&Player::new("b1", 1200)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.snapshot_ordered_for_update().await.unwrap();

        let cleanup = {
            let store = store.clone();
            tokio::spawn(async move { store.dequeue_many(&["a1".to_string()]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cleanup.is_finished(), "dequeue must wait for the lock");

        tx.dequeue_many(&["a1".to_string(), "b1".to_string()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // The matcher already took the row, so the late delete finds nothing
        assert_eq!(cleanup.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expire_older_than() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("old", 1000)).await.unwrap();
        std::thread::sleep(Duration::from_millis(60));
        store.enqueue(&Player::new("new", 1000)).await.unwrap();

        let expired = store
            .expire_older_than(Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert_eq!(ids(&store.waiting_players().await.unwrap()), vec!["new"]);
    }

    #[tokio::test]
    async fn test_expire_with_unbounded_age_keeps_everything() {
        let store = InMemoryQueueStore::new();
        store.enqueue(&Player::new("a1", 1000)).await.unwrap();

        let expired = store
            .expire_older_than(Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert!(expired.is_empty());
        assert_eq!(store.waiting_players().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_session_for_player_returns_latest_since() {
        let store = InMemoryQueueStore::new();
        let factory = SessionFactory::new();
        let earlier = factory.create(Player::new("a1", 1000), Player::new("b1", 1200));
        let mut tx = store.begin().await.unwrap();
        tx.insert_session(&earlier).await.unwrap();
        tx.commit().await.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let registered_at = current_timestamp();
        let later = factory.create(Player::new("c1", 900), Player::new("a1", 1000));
        let mut tx = store.begin().await.unwrap();
        tx.insert_session(&later).await.unwrap();
        tx.commit().await.unwrap();

        let found = store
            .find_session_for_player("a1", registered_at)
            .await
            .unwrap();
        assert_eq!(found, Some(later));

        // Sessions from before the registration do not count
        let found = store
            .find_session_for_player("b1", registered_at)
            .await
            .unwrap();
        assert_eq!(found, None);
        assert_eq!(
            store
                .find_session_for_player("b1", earlier.start_time)
                .await
                .unwrap(),
            Some(earlier)
        );
    }
}
