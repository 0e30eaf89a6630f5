//! Common types used throughout the matchmaking service

use crate::error::{MatchmakingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for players
pub type PlayerId = String;

/// Unique identifier for sessions
pub type SessionId = String;

/// Player information for matchmaking
///
/// The rating travels with the player into the session but plays no part in
/// pairing decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub rating: i64,
}

impl Player {
    pub fn new(id: impl Into<PlayerId>, rating: i64) -> Self {
        Self {
            id: id.into(),
            rating,
        }
    }

    /// Reject players that cannot be queued
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "player id must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// A player waiting in the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub player: Player,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion order, used to break ties between equal timestamps
    pub sequence: u64,
}

impl QueueEntry {
    /// How long this entry has been waiting at `now`
    pub fn waited(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.enqueued_at)
    }
}

/// A two-party session created by the matching processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub player1: Player,
    pub player2: Player,
    pub start_time: DateTime<Utc>,
}

impl Session {
    /// Whether the given player takes part in this session
    pub fn includes(&self, player_id: &str) -> bool {
        self.player1.id == player_id || self.player2.id == player_id
    }

    /// The other participant, if `player_id` is one of the two
    pub fn opponent_of(&self, player_id: &str) -> Option<&Player> {
        if self.player1.id == player_id {
            Some(&self.player2)
        } else if self.player2.id == player_id {
            Some(&self.player1)
        } else {
            None
        }
    }
}
