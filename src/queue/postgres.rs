//! PostgreSQL-backed queue store using sqlx.
//!
//! Tables:
//! - `matchmaking_queue`: one row per waiting player, ordered by
//!   `waiting_since` with `seq` as insertion-order tiebreaker
//! - `sessions`: created sessions, immutable once inserted
//!
//! Matching passes lock the queue rows they read with `SELECT ... FOR UPDATE`,
//! so a concurrent `DELETE` from a timing-out registration waits for the pass
//! to commit or roll back.

use crate::error::{MatchmakingError, Result};
use crate::queue::store::{QueueStore, QueueTransaction};
use crate::types::{Player, PlayerId, QueueEntry, Session};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

/// Ages beyond this are clamped so the interval stays in range
const MAX_ENTRY_AGE_SECONDS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS matchmaking_queue (
        player_id     TEXT PRIMARY KEY,
        rating        BIGINT NOT NULL,
        waiting_since TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        seq           BIGSERIAL NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS matchmaking_queue_order_idx
        ON matchmaking_queue (waiting_since, seq)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id     TEXT PRIMARY KEY,
        player1_id     TEXT NOT NULL,
        player1_rating BIGINT NOT NULL,
        player2_id     TEXT NOT NULL,
        player2_rating BIGINT NOT NULL,
        start_time     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sessions_player1_idx ON sessions (player1_id, start_time)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sessions_player2_idx ON sessions (player2_id, start_time)
    "#,
];

/// PostgreSQL queue store.
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    /// Create a store over an existing connection pool.
    ///
    /// Call [`ensure_schema`](Self::ensure_schema) before first use.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool to `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| MatchmakingError::storage("failed to connect to database", e))?;

        info!(
            "Connected to PostgreSQL - max_connections: {}",
            max_connections
        );
        Ok(Self::new(pool))
    }

    /// Create the queue and session tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MatchmakingError::storage("schema initialization failed", e))?;
        }
        debug!("Queue schema ready ({} statements)", SCHEMA.len());
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn row_to_entry(row: &PgRow) -> Result<QueueEntry> {
    let decode = |e: sqlx::Error| MatchmakingError::storage("failed to decode queue row", e);
    let seq: i64 = row.try_get("seq").map_err(decode)?;
    Ok(QueueEntry {
        player: Player {
            id: row.try_get("player_id").map_err(decode)?,
            rating: row.try_get("rating").map_err(decode)?,
        },
        enqueued_at: row.try_get("waiting_since").map_err(decode)?,
        sequence: seq.max(0) as u64,
    })
}

fn row_to_session(row: &PgRow) -> Result<Session> {
    let decode = |e: sqlx::Error| MatchmakingError::storage("failed to decode session row", e);
    Ok(Session {
        session_id: row.try_get("session_id").map_err(decode)?,
        player1: Player {
            id: row.try_get("player1_id").map_err(decode)?,
            rating: row.try_get("player1_rating").map_err(decode)?,
        },
        player2: Player {
            id: row.try_get("player2_id").map_err(decode)?,
            rating: row.try_get("player2_rating").map_err(decode)?,
        },
        start_time: row.try_get("start_time").map_err(decode)?,
    })
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, player: &Player) -> Result<QueueEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO matchmaking_queue (player_id, rating, waiting_since)
            VALUES ($1, $2, NOW())
            RETURNING player_id, rating, waiting_since, seq
            "#,
        )
        .bind(&player.id)
        .bind(player.rating)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MatchmakingError::DuplicateEntry {
                    player_id: player.id.clone(),
                }
            } else {
                MatchmakingError::storage("enqueue failed", e)
            }
        })?;

        row_to_entry(&row)
    }

    async fn dequeue_many(&self, player_ids: &[PlayerId]) -> Result<u64> {
        if player_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM matchmaking_queue WHERE player_id = ANY($1)")
            .bind(player_ids)
            .execute(&self.pool)
            .await
            .map_err(|e| MatchmakingError::storage("dequeue failed", e))?;

        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<Box<dyn QueueTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MatchmakingError::storage("failed to begin transaction", e))?;

        Ok(Box::new(PgQueueTransaction { tx: Some(tx) }))
    }

    async fn waiting_players(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT player_id, rating, waiting_since, seq
            FROM matchmaking_queue
            ORDER BY waiting_since ASC, seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MatchmakingError::storage("failed to read queue", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn expire_older_than(&self, max_age: Duration) -> Result<Vec<PlayerId>> {
        // `waiting_since` is stamped by the database clock, so age it there too
        let seconds = max_age.as_secs_f64().min(MAX_ENTRY_AGE_SECONDS);
        let rows = sqlx::query(
            r#"
            DELETE FROM matchmaking_queue
            WHERE waiting_since < NOW() - make_interval(secs => $1)
            RETURNING player_id
            "#,
        )
        .bind(seconds)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MatchmakingError::storage("failed to expire queue entries", e))?;

        rows.iter()
            .map(|row| {
                row.try_get("player_id")
                    .map_err(|e| MatchmakingError::storage("failed to decode expired id", e))
            })
            .collect()
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, player1_id, player1_rating, player2_id, player2_rating, start_time
            FROM sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MatchmakingError::storage("failed to read session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn find_session_for_player(
        &self,
        player_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, player1_id, player1_rating, player2_id, player2_rating, start_time
            FROM sessions
            WHERE (player1_id = $1 OR player2_id = $1) AND start_time >= $2
            ORDER BY start_time DESC
            LIMIT 1
            "#,
        )
        .bind(player_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MatchmakingError::storage("failed to read player session", e))?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, player1_id, player1_rating, player2_id, player2_rating, start_time
            FROM sessions
            ORDER BY start_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MatchmakingError::storage("failed to read sessions", e))?;

        rows.iter().map(row_to_session).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MatchmakingError::storage("database ping failed", e))?;
        Ok(())
    }
}

/// A PostgreSQL transaction for one matching pass.
///
/// If dropped without committing, sqlx rolls the transaction back.
pub struct PgQueueTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgQueueTransaction {
    fn active(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or_else(|| MatchmakingError::StorageFailure {
            message: "transaction already committed or rolled back".to_string(),
        })
    }
}

#[async_trait]
impl QueueTransaction for PgQueueTransaction {
    async fn snapshot_ordered_for_update(&mut self) -> Result<Vec<QueueEntry>> {
        let tx = self.active()?;
        let rows = sqlx::query(
            r#"
            SELECT player_id, rating, waiting_since, seq
            FROM matchmaking_queue
            ORDER BY waiting_since ASC, seq ASC
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| MatchmakingError::storage("failed to lock queue snapshot", e))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn dequeue_many(&mut self, player_ids: &[PlayerId]) -> Result<u64> {
        if player_ids.is_empty() {
            return Ok(0);
        }

        let tx = self.active()?;
        let result = sqlx::query("DELETE FROM matchmaking_queue WHERE player_id = ANY($1)")
            .bind(player_ids)
            .execute(&mut **tx)
            .await
            .map_err(|e| MatchmakingError::storage("transaction dequeue failed", e))?;

        Ok(result.rows_affected())
    }

    async fn insert_session(&mut self, session: &Session) -> Result<()> {
        let tx = self.active()?;
        sqlx::query(
            r#"
            INSERT INTO sessions
                (session_id, player1_id, player1_rating, player2_id, player2_rating, start_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.player1.id)
        .bind(session.player1.rating)
        .bind(&session.player2.id)
        .bind(session.player2.rating)
        .bind(session.start_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| MatchmakingError::storage("session insert failed", e))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let tx = this.tx.take().ok_or_else(|| MatchmakingError::StorageFailure {
            message: "transaction already committed or rolled back".to_string(),
        })?;

        tx.commit()
            .await
            .map_err(|e| MatchmakingError::storage("transaction commit failed", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let tx = this.tx.take().ok_or_else(|| MatchmakingError::StorageFailure {
            message: "transaction already committed or rolled back".to_string(),
        })?;

        tx.rollback()
            .await
            .map_err(|e| MatchmakingError::storage("transaction rollback failed", e))
    }
}
