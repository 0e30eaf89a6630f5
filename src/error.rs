//! Error types for the matchmaking service
//!
//! Domain operations return [`MatchmakingError`]; application wiring
//! (configuration, bootstrap, the binary) works with `anyhow`.

use std::fmt;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MatchmakingError>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Player already waiting in queue: {player_id}")]
    DuplicateEntry { player_id: String },

    #[error("No opponent found for player '{player_id}' within {waited_seconds}s")]
    Timeout {
        player_id: String,
        waited_seconds: u64,
    },

    #[error("Storage failure: {message}")]
    StorageFailure { message: String },

    #[error("Waiter already registered for player: {player_id}")]
    AlreadyRegistered { player_id: String },

    #[error("Invalid registration request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

/// Client-visible classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    BadRequest,
    Conflict,
    Timeout,
    Internal,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::BadRequest => "bad_request",
            ErrorStatus::Conflict => "conflict",
            ErrorStatus::Timeout => "timeout",
            ErrorStatus::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MatchmakingError {
    /// Build a storage failure from any displayable driver error
    pub fn storage(context: &str, err: impl fmt::Display) -> Self {
        MatchmakingError::StorageFailure {
            message: format!("{}: {}", context, err),
        }
    }

    /// Status reported to the caller of a registration
    pub fn status(&self) -> ErrorStatus {
        match self {
            MatchmakingError::InvalidRequest { .. } => ErrorStatus::BadRequest,
            MatchmakingError::DuplicateEntry { .. } => ErrorStatus::Conflict,
            MatchmakingError::Timeout { .. } => ErrorStatus::Timeout,
            MatchmakingError::StorageFailure { .. }
            | MatchmakingError::AlreadyRegistered { .. }
            | MatchmakingError::ConfigurationError { .. }
            | MatchmakingError::InternalError { .. } => ErrorStatus::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let duplicate = MatchmakingError::DuplicateEntry {
            player_id: "a1".to_string(),
        };
        assert_eq!(duplicate.status(), ErrorStatus::Conflict);

        let timeout = MatchmakingError::Timeout {
            player_id: "a1".to_string(),
            waited_seconds: 30,
        };
        assert_eq!(timeout.status(), ErrorStatus::Timeout);
        assert_eq!(
            timeout.to_string(),
            "No opponent found for player 'a1' within 30s"
        );

        let storage = MatchmakingError::storage("insert failed", "connection reset");
        assert_eq!(storage.status(), ErrorStatus::Internal);
        assert_eq!(
            storage.to_string(),
            "Storage failure: insert failed: connection reset"
        );

        // Registry invariant violations are never reported as conflicts
        let registered = MatchmakingError::AlreadyRegistered {
            player_id: "a1".to_string(),
        };
        assert_eq!(registered.status(), ErrorStatus::Internal);
    }
}
