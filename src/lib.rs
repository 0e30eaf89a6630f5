//! Duel Room - two-player matchmaking service
//!
//! This crate pairs waiting players into two-party sessions in arrival order.
//! Players wait in a durable queue; a background matcher pairs them under a
//! transaction and wakes each waiting registration through an in-process
//! registry of one-shot delivery handles.

pub mod api;
pub mod config;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{ErrorStatus, MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use matching::{MatchingProcessor, QueueReaper};
pub use orchestrator::RegistrationOrchestrator;
pub use queue::{InMemoryQueueStore, PgQueueStore, QueueStore, QueueTransaction};
pub use registry::{WaiterHandle, WaiterRegistry};
pub use session::SessionFactory;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
