//! Waiter registry
//!
//! Correlates a match produced by the matching processor with the specific
//! registration that is waiting for it. Each waiting player owns a one-shot
//! slot; whichever of delivery or unregistration reaches the slot first
//! removes it, and the other finds nothing.

use crate::error::{MatchmakingError, Result};
use crate::types::{PlayerId, Session};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving side of a registration
#[derive(Debug)]
pub struct WaiterHandle {
    player_id: PlayerId,
    receiver: oneshot::Receiver<Session>,
}

impl WaiterHandle {
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Split into the raw receiver
    pub fn into_receiver(self) -> oneshot::Receiver<Session> {
        self.receiver
    }
}

/// Process-local map of players waiting for a session
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    waiters: Mutex<HashMap<PlayerId, oneshot::Sender<Session>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<PlayerId, oneshot::Sender<Session>>> {
        // The map holds no invariants a panicking holder could break
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a delivery slot for `player_id`
    pub fn register(&self, player_id: &str) -> Result<WaiterHandle> {
        let mut waiters = self.waiters();
        if waiters.contains_key(player_id) {
            return Err(MatchmakingError::AlreadyRegistered {
                player_id: player_id.to_string(),
            });
        }

        let (sender, receiver) = oneshot::channel();
        waiters.insert(player_id.to_string(), sender);
        debug!(
            "Registered waiter for player '{}' - pending: {}",
            player_id,
            waiters.len()
        );

        Ok(WaiterHandle {
            player_id: player_id.to_string(),
            receiver,
        })
    }

    /// Hand `session` to the waiter for `player_id` and remove its slot.
    ///
    /// Returns false if no slot existed or its receiver is already gone.
    pub fn deliver(&self, player_id: &str, session: Session) -> bool {
        let sender = self.waiters().remove(player_id);

        match sender {
            Some(sender) => {
                if sender.send(session).is_ok() {
                    true
                } else {
                    warn!(
                        "Waiter for player '{}' went away before its session arrived",
                        player_id
                    );
                    false
                }
            }
            None => {
                debug!("No waiter registered for player '{}'", player_id);
                false
            }
        }
    }

    /// Remove the slot for `player_id` without delivering
    pub fn unregister(&self, player_id: &str) -> bool {
        self.waiters().remove(player_id).is_some()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.waiters().contains_key(player_id)
    }

    /// Number of registrations currently waiting
    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionFactory;
    use crate::types::Player;
    use std::sync::Arc;

    fn test_session() -> Session {
        SessionFactory::new().create(Player::new("a1", 1000), Player::new("b1", 1200))
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let registry = WaiterRegistry::new();
        let handle = registry.register("a1").unwrap();
        assert_eq!(handle.player_id(), "a1");
        assert!(registry.contains("a1"));

        let session = test_session();
        assert!(registry.deliver("a1", session.clone()));
        assert!(registry.is_empty());

        let received = handle.into_receiver().await.unwrap();
        assert_eq!(received, session);
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = WaiterRegistry::new();
        let _handle = registry.register("a1").unwrap();

        let err = registry.register("a1").unwrap_err();
        assert!(matches!(err, MatchmakingError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deliver_without_waiter() {
        let registry = WaiterRegistry::new();
        assert!(!registry.deliver("ghost", test_session()));
    }

    #[test]
    fn test_unregister_then_deliver() {
        let registry = WaiterRegistry::new();
        let _handle = registry.register("a1").unwrap();

        assert!(registry.unregister("a1"));
        assert!(!registry.unregister("a1"));
        assert!(!registry.deliver("a1", test_session()));
    }

    #[test]
    fn test_deliver_then_unregister() {
        let registry = WaiterRegistry::new();
        let _handle = registry.register("a1").unwrap();

        assert!(registry.deliver("a1", test_session()));
        assert!(!registry.unregister("a1"));
    }

    #[test]
    fn test_deliver_to_abandoned_handle_does_not_block() {
        let registry = WaiterRegistry::new();
        let handle = registry.register("a1").unwrap();
        drop(handle);

        assert!(!registry.deliver("a1", test_session()));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deliver_and_unregister_race_has_one_winner() {
        for round in 0..200 {
            let registry = Arc::new(WaiterRegistry::new());
            let player_id = format!("p{}", round);
            let _handle = registry.register(&player_id).unwrap();

            let deliver = {
                let registry = registry.clone();
                let player_id = player_id.clone();
                tokio::spawn(async move { registry.deliver(&player_id, test_session()) })
            };
            let unregister = {
                let registry = registry.clone();
                let player_id = player_id.clone();
                tokio::spawn(async move { registry.unregister(&player_id) })
            };

            let delivered = deliver.await.unwrap();
            let unregistered = unregister.await.unwrap();
            assert!(
                delivered ^ unregistered,
                "exactly one side must win (round {})",
                round
            );
            assert!(registry.is_empty());
        }
    }
}
