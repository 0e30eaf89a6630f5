//! Waiting queue storage
//!
//! This module defines the durable queue of waiting players together with
//! its in-memory and PostgreSQL implementations.

pub mod memory;
pub mod postgres;
pub mod store;

// Re-export commonly used types
pub use memory::InMemoryQueueStore;
pub use postgres::PgQueueStore;
pub use store::{QueueStore, QueueTransaction};
