//! Main application state and service coordination
//!
//! This module contains the production AppState that owns the queue store,
//! the waiter registry and the matching components, and runs the API server,
//! health server and background loops.

use crate::api;
use crate::config::{AppConfig, StorageBackend};
use crate::matching::{MatchingProcessor, QueueReaper};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector};
use crate::orchestrator::RegistrationOrchestrator;
use crate::queue::{InMemoryQueueStore, PgQueueStore, QueueStore};
use crate::registry::WaiterRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// How long each background task gets to finish after the shutdown signal
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the gauge refresh task
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Storage connection error: {message}")]
    StorageConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Durable queue of waiting players
    store: Arc<dyn QueueStore>,

    /// Pending registrations awaiting a session
    registry: Arc<WaiterRegistry>,

    /// Core matchmaking components
    processor: Arc<MatchingProcessor>,
    orchestrator: Arc<RegistrationOrchestrator>,
    reaper: Arc<QueueReaper>,

    /// Metrics collector shared by all components
    metrics_collector: Arc<MetricsCollector>,

    /// Health server, created on start
    health_server: Mutex<Option<Arc<HealthServer>>>,

    /// Background task handles
    background_tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Shutdown signal for the API server and matching loops
    shutdown_tx: broadcast::Sender<()>,

    /// Bound API address once started
    api_addr: RwLock<Option<SocketAddr>>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
}

impl AppState {
    /// Initialize the application, connecting to the configured store
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing duel-room matchmaking service");
        info!(
            "Configuration: service={}, storage={}",
            config.service.name, config.storage.backend
        );

        let store = Self::initialize_store(&config).await?;
        Self::with_store(config, store)
    }

    /// Initialize the application over an existing queue store
    pub fn with_store(config: AppConfig, store: Arc<dyn QueueStore>) -> Result<Self, ServiceError> {
        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let registry = Arc::new(WaiterRegistry::new());
        let settings = &config.matchmaking;

        let processor = Arc::new(
            MatchingProcessor::new(store.clone(), registry.clone(), settings)
                .with_metrics(metrics_collector.clone()),
        );
        let orchestrator = Arc::new(
            RegistrationOrchestrator::new(store.clone(), registry.clone(), settings)
                .with_metrics(metrics_collector.clone()),
        );
        let reaper = Arc::new(
            QueueReaper::new(store.clone(), settings).with_metrics(metrics_collector.clone()),
        );

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            store,
            registry,
            processor,
            orchestrator,
            reaper,
            metrics_collector,
            health_server: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            api_addr: RwLock::new(None),
            is_running: Arc::new(RwLock::new(false)),
        })
    }

    /// Connect the configured queue store
    async fn initialize_store(config: &AppConfig) -> Result<Arc<dyn QueueStore>, ServiceError> {
        match config.storage.backend {
            StorageBackend::Memory => {
                warn!("Using in-memory queue store - queued players are lost on restart");
                Ok(Arc::new(InMemoryQueueStore::new()))
            }
            StorageBackend::Postgres => {
                let url = config.storage.database_url.as_deref().ok_or_else(|| {
                    ServiceError::Configuration {
                        message: "Postgres backend requires a database URL".to_string(),
                    }
                })?;

                info!("Connecting to PostgreSQL queue store");
                let store = PgQueueStore::connect(
                    url,
                    config.storage.max_connections,
                    config.connect_timeout(),
                )
                .await
                .map_err(|e| ServiceError::StorageConnection {
                    message: e.to_string(),
                })?;

                store
                    .ensure_schema()
                    .await
                    .map_err(|e| ServiceError::StorageConnection {
                        message: e.to_string(),
                    })?;

                Ok(Arc::new(store))
            }
        }
    }

    /// Start the servers and background loops
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting duel-room matchmaking service");

        // Mark as running
        *self.is_running.write().await = true;

        // Health endpoints first so probes answer during startup
        self.start_health_server().await?;

        self.start_api_server().await?;

        self.start_background_tasks().await;

        info!("✅ Duel-room matchmaking service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of duel-room service");

        // Mark as not running
        *self.is_running.write().await = false;

        if self.shutdown_tx.send(()).is_err() {
            debug!("No background task was listening for shutdown");
        }

        if let Some(health_server) = self.health_server.lock().await.take() {
            if let Err(e) = health_server.stop().await {
                warn!("Failed to stop health server: {}", e);
            }
        }

        self.stop_background_tasks().await;

        let pending = self.registry.len();
        if pending > 0 {
            warn!(
                "{} registrations still waiting at shutdown - their queue entries remain",
                pending
            );
        }

        let final_stats =
            self.processor
                .stats()
                .map_err(|e| ServiceError::BackgroundTask {
                    message: format!("Failed to get final stats: {}", e),
                })?;

        info!("Final matching statistics: {:?}", final_stats);
        info!("✅ Duel-room service shutdown completed");

        Ok(())
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<WaiterRegistry> {
        self.registry.clone()
    }

    pub fn processor(&self) -> Arc<MatchingProcessor> {
        self.processor.clone()
    }

    pub fn orchestrator(&self) -> Arc<RegistrationOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn reaper(&self) -> Arc<QueueReaper> {
        self.reaper.clone()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Address the API server is bound to, once started
    pub async fn api_addr(&self) -> Option<SocketAddr> {
        *self.api_addr.read().await
    }

    async fn start_health_server(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting metrics and health endpoints");

        let health_config = HealthServerConfig {
            port: self.config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let health_server = Arc::new(
            HealthServer::new(health_config, self.metrics_collector.clone())
                .with_app_state(self.clone()),
        );

        let listener = health_server
            .bind()
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to bind health server: {}", e),
            })?;

        let server = health_server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("Health server failed: {}", e);
            } else {
                info!("Health server task completed");
            }
        });

        *self.health_server.lock().await = Some(health_server);
        self.background_tasks.lock().await.push(handle);
        Ok(())
    }

    async fn start_api_server(&self) -> Result<(), ServiceError> {
        let listener = api::http::bind("0.0.0.0", self.config.service.http_port)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("{:#}", e),
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to read API address: {}", e),
            })?;
        *self.api_addr.write().await = Some(addr);

        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(e) = api::http::serve(listener, orchestrator, shutdown).await {
                error!("API server failed: {}", e);
            }
        });

        self.background_tasks.lock().await.push(handle);
        info!("✅ Matchmaking API started on {}", addr);
        Ok(())
    }

    /// Start the matching loop, the reaper and the gauge refresh task
    async fn start_background_tasks(&self) {
        info!("Starting background tasks...");

        let matching_task = tokio::spawn(
            self.processor
                .clone()
                .run(self.shutdown_tx.subscribe()),
        );

        let reaper_task = tokio::spawn(self.reaper.clone().run(self.shutdown_tx.subscribe()));

        info!(
            "Starting metrics refresh task ({}s interval)...",
            METRICS_REFRESH_INTERVAL.as_secs()
        );
        let metrics_task = {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let processor = self.processor.clone();
            let metrics_collector = self.metrics_collector.clone();
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(METRICS_REFRESH_INTERVAL);
                let start_time = tokio::time::Instant::now();

                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => {}
                    }

                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(start_time.elapsed().as_secs() as i64);

                    let store_ok = match store.waiting_players().await {
                        Ok(waiting) => {
                            metrics_collector.update_queue_depth(waiting.len(), registry.len());
                            true
                        }
                        Err(e) => {
                            warn!("Failed to read queue depth for metrics: {}", e);
                            false
                        }
                    };
                    let matcher_ok = processor
                        .stats()
                        .map(|stats| stats.consecutive_failures == 0)
                        .unwrap_or(false);

                    metrics_collector.update_component_health("queue_store", store_ok);
                    metrics_collector.update_component_health("matching_processor", matcher_ok);
                    let status = match (store_ok, matcher_ok) {
                        (true, true) => 2,
                        (true, false) => 1,
                        _ => 0,
                    };
                    metrics_collector.update_health_status(status);
                }

                info!("Metrics refresh task stopped");
            })
        };

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(matching_task);
        tasks.push(reaper_task);
        tasks.push(metrics_task);

        info!("3 background tasks started successfully");
    }

    /// Wait for background tasks, aborting any that do not stop in time
    async fn stop_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        let task_count = tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        for (i, mut task) in tasks.into_iter().enumerate() {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("Aborting background task {}/{}", i + 1, task_count);
                task.abort();
            }
        }

        info!("✅ All {} background tasks stopped", task_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Player;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.service.http_port = 0;
        config.service.health_port = 0;
        config.matchmaking.tick_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_memory_backend_initialization() {
        let app = AppState::new(AppConfig::default()).await.unwrap();
        assert!(!app.is_running().await);
        assert!(app.store().ping().await.is_ok());
        assert!(app.registry().is_empty());
        assert!(app.api_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_postgres_backend_requires_url() {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Postgres;

        let err = AppState::new(config).await.err().unwrap();
        assert!(matches!(err, ServiceError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_start_match_and_shutdown() {
        let app = Arc::new(
            AppState::with_store(test_config(), Arc::new(InMemoryQueueStore::new())).unwrap(),
        );
        app.start().await.unwrap();
        assert!(app.is_running().await);
        assert!(app.api_addr().await.is_some());

        let orchestrator = app.orchestrator();
        let (a1, b1) = tokio::join!(
            orchestrator.register_and_wait(Player::new("a1", 1000)),
            orchestrator.register_and_wait(Player::new("b1", 1200)),
        );
        let (a1, b1) = (a1.unwrap(), b1.unwrap());
        assert_eq!(a1.session_id, b1.session_id);

        app.shutdown().await.unwrap();
        assert!(!app.is_running().await);
        assert_eq!(app.processor().stats().unwrap().sessions_created, 1);
    }
}
