//! Metrics and monitoring for the duel-room matchmaking service
//!
//! This module provides Prometheus metrics collection and the HTTP server
//! exposing health probes, metrics and service statistics.

pub mod collector;
pub mod health;

pub use collector::{
    MatchingMetrics, MetricsCollector, MetricsTimer, QueueMetrics, RegistrationOutcome,
    ServiceMetrics, TickOutcome,
};
pub use health::{HealthServer, HealthServerConfig};
