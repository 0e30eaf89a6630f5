//! External API for the matchmaking service

pub mod http;

pub use http::{router, ApiError, MatchmakingRequest};
