//! Session creation

use crate::types::{Player, Session};
use crate::utils::{current_timestamp, generate_session_id};

/// Assembles session records for matched pairs
#[derive(Debug, Clone, Default)]
pub struct SessionFactory;

impl SessionFactory {
    pub fn new() -> Self {
        Self
    }

    /// Create a session for two players, stamping the start time now
    pub fn create(&self, player1: Player, player2: Player) -> Session {
        Session {
            session_id: generate_session_id(),
            player1,
            player2,
            start_time: current_timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_session() {
        let factory = SessionFactory::new();
        let before = current_timestamp();
        let session = factory.create(Player::new("a1", 1000), Player::new("b1", 1200));

        assert!(session.session_id.starts_with("session-"));
        assert_eq!(session.player1, Player::new("a1", 1000));
        assert_eq!(session.player2, Player::new("b1", 1200));
        assert!(session.start_time >= before);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let factory = SessionFactory::new();
        let first = factory.create(Player::new("a1", 1000), Player::new("b1", 1200));
        let second = factory.create(Player::new("a1", 1000), Player::new("b1", 1200));
        assert_ne!(first.session_id, second.session_id);
    }
}
