//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the duel-room matchmaking
//! service using Prometheus metrics.

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a single registration request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Matched,
    Conflict,
    Timeout,
    Failed,
}

impl RegistrationOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            RegistrationOutcome::Matched => "matched",
            RegistrationOutcome::Conflict => "conflict",
            RegistrationOutcome::Timeout => "timeout",
            RegistrationOutcome::Failed => "failed",
        }
    }
}

/// Outcome of a single matching tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Matched,
    Failed,
}

impl TickOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            TickOutcome::Idle => "idle",
            TickOutcome::Matched => "matched",
            TickOutcome::Failed => "failed",
        }
    }
}

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue and registration metrics
    queue_metrics: QueueMetrics,

    /// Matching processor metrics
    matching_metrics: MatchingMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue and registration metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Registrations by outcome
    pub registrations_total: IntCounterVec,

    /// Players currently in the waiting queue
    pub players_waiting: IntGauge,

    /// Registrations currently blocked on a delivery handle
    pub pending_waiters: IntGauge,

    /// Time a registration spent waiting before it resolved
    pub queue_wait_time_seconds: Histogram,
}

/// Matching processor metrics
#[derive(Clone)]
pub struct MatchingMetrics {
    /// Ticks by outcome
    pub ticks_total: IntCounterVec,

    /// Sessions committed
    pub sessions_created_total: IntCounter,

    /// Sessions whose delivery found no waiter
    pub undelivered_total: IntCounter,

    /// Duration of a matching tick
    pub tick_duration_seconds: Histogram,

    /// Queue entries removed by the reaper
    pub entries_expired_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let matching_metrics = MatchingMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            matching_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get queue metrics
    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    /// Get matching metrics
    pub fn matching(&self) -> &MatchingMetrics {
        &self.matching_metrics
    }

    /// Record a finished registration
    pub fn record_registration(&self, outcome: RegistrationOutcome, waited: Duration) {
        self.queue_metrics
            .registrations_total
            .with_label_values(&[outcome.as_label()])
            .inc();

        if matches!(
            outcome,
            RegistrationOutcome::Matched | RegistrationOutcome::Timeout
        ) {
            self.queue_metrics
                .queue_wait_time_seconds
                .observe(waited.as_secs_f64());
        }
    }

    /// Record a matching tick
    pub fn record_tick(&self, outcome: TickOutcome, sessions: usize, duration: Duration) {
        self.matching_metrics
            .ticks_total
            .with_label_values(&[outcome.as_label()])
            .inc();
        self.matching_metrics
            .sessions_created_total
            .inc_by(sessions as u64);
        self.matching_metrics
            .tick_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a session that reached neither player
    pub fn record_undelivered(&self, count: u64) {
        self.matching_metrics.undelivered_total.inc_by(count);
    }

    /// Record entries removed by the reaper
    pub fn record_expired(&self, count: usize) {
        self.matching_metrics
            .entries_expired_total
            .inc_by(count as u64);
    }

    /// Update the waiting queue and registry gauges
    pub fn update_queue_depth(&self, players_waiting: usize, pending_waiters: usize) {
        self.queue_metrics
            .players_waiting
            .set(players_waiting as i64);
        self.queue_metrics
            .pending_waiters
            .set(pending_waiters as i64);
    }

    /// Total sessions committed since start
    pub fn sessions_created(&self) -> u64 {
        self.matching_metrics.sessions_created_total.get()
    }

    /// Total registrations with the given outcome since start
    pub fn registrations(&self, outcome: RegistrationOutcome) -> u64 {
        self.queue_metrics
            .registrations_total
            .with_label_values(&[outcome.as_label()])
            .get()
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("duel_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "duel_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("duel_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let registrations_total = IntCounterVec::new(
            Opts::new(
                "duel_room_registrations_total",
                "Registrations by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(registrations_total.clone()))?;

        let players_waiting = IntGauge::new(
            "duel_room_players_waiting",
            "Players currently in the waiting queue",
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let pending_waiters = IntGauge::new(
            "duel_room_pending_waiters",
            "Registrations waiting for a session",
        )?;
        registry.register(Box::new(pending_waiters.clone()))?;

        let queue_wait_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "duel_room_queue_wait_time_seconds",
                "Time from registration to match or timeout",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(queue_wait_time_seconds.clone()))?;

        Ok(Self {
            registrations_total,
            players_waiting,
            pending_waiters,
            queue_wait_time_seconds,
        })
    }
}

impl MatchingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let ticks_total = IntCounterVec::new(
            Opts::new("duel_room_matching_ticks_total", "Matching ticks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let sessions_created_total = IntCounter::new(
            "duel_room_sessions_created_total",
            "Total sessions created",
        )?;
        registry.register(Box::new(sessions_created_total.clone()))?;

        let undelivered_total = IntCounter::new(
            "duel_room_sessions_undelivered_total",
            "Session deliveries that found no waiting registration",
        )?;
        registry.register(Box::new(undelivered_total.clone()))?;

        let tick_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "duel_room_matching_tick_duration_seconds",
                "Matching tick duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        let entries_expired_total = IntCounter::new(
            "duel_room_queue_entries_expired_total",
            "Stale queue entries removed by the reaper",
        )?;
        registry.register(Box::new(entries_expired_total.clone()))?;

        Ok(Self {
            ticks_total,
            sessions_created_total,
            undelivered_total,
            tick_duration_seconds,
            entries_expired_total,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics collector")
    }
}
