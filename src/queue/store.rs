//! Queue storage interface
//!
//! The waiting queue is the single source of truth for who is waiting. All
//! mutation goes through short-lived operations or through a
//! [`QueueTransaction`], whose snapshot locks the rows it returns until the
//! transaction ends.

use crate::error::Result;
use crate::types::{Player, PlayerId, QueueEntry, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable storage for waiting players and created sessions
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new entry stamped with the current time.
    ///
    /// Fails with `DuplicateEntry` if the player is already waiting.
    async fn enqueue(&self, player: &Player) -> Result<QueueEntry>;

    /// Remove the listed players, returning how many entries were removed.
    ///
    /// Ids that are not present are ignored. Blocks while another
    /// transaction holds a lock on any of the rows.
    async fn dequeue_many(&self, player_ids: &[PlayerId]) -> Result<u64>;

    /// Begin a transaction for a matching pass
    async fn begin(&self) -> Result<Box<dyn QueueTransaction>>;

    /// Current entries ordered by enqueue time, without taking locks
    async fn waiting_players(&self) -> Result<Vec<QueueEntry>>;

    /// Remove entries that have waited longer than `max_age`, returning the
    /// removed ids.
    ///
    /// Age is measured against the clock that stamped the entries.
    async fn expire_older_than(&self, max_age: Duration) -> Result<Vec<PlayerId>>;

    /// Look up a persisted session
    async fn find_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Most recent session that includes `player_id` and started at or after
    /// `since`
    async fn find_session_for_player(
        &self,
        player_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// All persisted sessions, oldest first
    async fn sessions(&self) -> Result<Vec<Session>>;

    /// Verify the backend is reachable
    async fn ping(&self) -> Result<()>;
}

/// A unit of work over the queue.
///
/// Dropping a transaction without calling [`commit`](QueueTransaction::commit)
/// rolls it back.
#[async_trait]
pub trait QueueTransaction: Send {
    /// All entries ordered by ascending enqueue time (insertion order breaks
    /// ties), locked exclusively until the transaction ends
    async fn snapshot_ordered_for_update(&mut self) -> Result<Vec<QueueEntry>>;

    /// Remove the listed players within this transaction
    async fn dequeue_many(&mut self, player_ids: &[PlayerId]) -> Result<u64>;

    /// Persist a newly created session within this transaction
    async fn insert_session(&mut self, session: &Session) -> Result<()>;

    /// Make all changes durable and release locks
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all changes and release locks
    async fn rollback(self: Box<Self>) -> Result<()>;
}
