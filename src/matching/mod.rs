//! Background matching
//!
//! The matching processor pairs waiting players on a fixed interval; the
//! queue reaper expires entries that outlived every registration.

pub mod processor;
pub mod reaper;

pub use processor::{MatchingProcessor, MatchingStats};
pub use reaper::QueueReaper;
