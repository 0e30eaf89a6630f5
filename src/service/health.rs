//! Health check endpoints and monitoring
//!
//! This module provides health check functionality for the duel-room
//! matchmaking service, including readiness and liveness probes.

use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Upper bound on a storage ping during a health check
const STORE_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

impl HealthStatus {
    /// Combine with another component status, keeping the worse one
    fn worst(self, other: &HealthStatus) -> HealthStatus {
        match (&self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Service statistics
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Players currently in the waiting queue
    pub players_waiting: usize,
    /// Registrations blocked on a delivery handle
    pub pending_waiters: usize,
    /// Sessions created since service start
    pub sessions_created: u64,
    /// Matching ticks run since service start
    pub matching_ticks: u64,
    /// Matching ticks that rolled back
    pub failed_ticks: u64,
    /// Storage backend in use
    pub storage_backend: String,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let mut checks = Vec::new();

        let service_check = Self::check_service_running(&app_state).await;
        let mut overall_status = if service_check.status == HealthStatus::Healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        checks.push(service_check);

        let store_check = Self::check_queue_store(&app_state).await;
        overall_status = overall_status.worst(&store_check.status);
        checks.push(store_check);

        let matcher_check = Self::check_matching_processor(&app_state);
        overall_status = overall_status.worst(&matcher_check.status);
        checks.push(matcher_check);

        let stats = Self::gather_service_stats(&app_state).await;

        Ok(HealthCheck {
            status: overall_status,
            service: app_state.config().service.name.clone(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify service can handle requests
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        // Service must be running
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        // Registrations need a reachable queue store
        let store = Self::check_queue_store(&app_state).await.status;
        let matcher = Self::check_matching_processor(&app_state).status;
        Ok(store.worst(&matcher))
    }

    /// Check if service is running
    async fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if app_state.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Ping the queue store
    async fn check_queue_store(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) =
            match tokio::time::timeout(STORE_PING_TIMEOUT, app_state.store().ping()).await {
                Ok(Ok(())) => (HealthStatus::Healthy, None),
                Ok(Err(e)) => {
                    error!("Queue store ping failed: {}", e);
                    (HealthStatus::Unhealthy, Some(e.to_string()))
                }
                Err(_) => (
                    HealthStatus::Unhealthy,
                    Some(format!(
                        "Queue store did not answer within {}s",
                        STORE_PING_TIMEOUT.as_secs()
                    )),
                ),
            };

        ComponentCheck {
            name: "queue_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// A matcher whose recent ticks keep failing is degraded
    fn check_matching_processor(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match app_state.processor().stats() {
            Ok(stats) if stats.consecutive_failures == 0 => (HealthStatus::Healthy, None),
            Ok(stats) => (
                HealthStatus::Degraded,
                Some(format!(
                    "{} consecutive failed ticks, last error: {}",
                    stats.consecutive_failures,
                    stats.last_error.unwrap_or_default()
                )),
            ),
            Err(e) => (
                HealthStatus::Degraded,
                Some(format!("Stats check failed: {}", e)),
            ),
        };

        ComponentCheck {
            name: "matching_processor".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Gather current service statistics
    async fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let mut stats = ServiceStats {
            pending_waiters: app_state.registry().len(),
            storage_backend: app_state.config().storage.backend.to_string(),
            ..Default::default()
        };

        match app_state.store().waiting_players().await {
            Ok(waiting) => stats.players_waiting = waiting.len(),
            Err(e) => debug!("Failed to read queue for health check: {}", e),
        }

        match app_state.processor().stats() {
            Ok(matching) => {
                stats.sessions_created = matching.sessions_created;
                stats.matching_ticks = matching.ticks;
                stats.failed_ticks = matching.failed_ticks;
            }
            Err(e) => debug!("Failed to get matching stats for health check: {}", e),
        }

        stats
    }
}

/// Convert health check to JSON string
impl HealthCheck {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
