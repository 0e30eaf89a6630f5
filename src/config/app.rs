//! Main application configuration
//!
//! This module defines the primary configuration structures for the duel-room
//! matchmaking service, including TOML/environment loading and validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub storage: StorageSettings,
    pub matchmaking: MatchmakingSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for the matchmaking API
    pub http_port: u16,
    /// Port for health check and metrics endpoints
    pub health_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Which queue store backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => Err(anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Postgres => write!(f, "postgres"),
        }
    }
}

/// Queue storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// PostgreSQL connection string, required for the postgres backend
    pub database_url: Option<String>,
    /// Connection pool size
    pub max_connections: u32,
    /// Pool acquire timeout in seconds
    pub connect_timeout_seconds: u64,
}

/// Matchmaking-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Interval between matching ticks in milliseconds
    pub tick_interval_ms: u64,
    /// How long a registration waits for a match in seconds
    pub wait_timeout_seconds: u64,
    /// How long a timed-out registration waits for an already committed match
    pub delivery_grace_ms: u64,
    /// Maximum pairs formed in one matching transaction
    pub max_pairs_per_tick: usize,
    /// Queue entries older than this are expired by the reaper
    pub stale_entry_seconds: u64,
    /// Reaper interval in seconds
    pub cleanup_interval_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "duel-room".to_string(),
            log_level: "info".to_string(),
            http_port: 8080,
            health_port: 9090,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 10,
            connect_timeout_seconds: 5,
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            wait_timeout_seconds: 30,
            delivery_grace_ms: 5000,
            max_pairs_per_tick: 1,
            stale_entry_seconds: 120,
            cleanup_interval_seconds: 60,
        }
    }
}

impl MatchmakingSettings {
    /// Get tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Get registration deadline as Duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    /// Get delivery grace as Duration
    pub fn delivery_grace(&self) -> Duration {
        Duration::from_millis(self.delivery_grace_ms)
    }

    /// Get stale entry age as Duration
    pub fn stale_entry_age(&self) -> Duration {
        Duration::from_secs(self.stale_entry_seconds)
    }

    /// Get reaper interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", name, value))
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from a TOML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Invalid TOML configuration")?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Service settings
        if let Some(name) = lookup("SERVICE_NAME") {
            config.service.name = name;
        }
        if let Some(log_level) = lookup("LOG_LEVEL") {
            config.service.log_level = log_level;
        }
        if let Some(port) = lookup("HTTP_PORT") {
            config.service.http_port = parse_var("HTTP_PORT", &port)?;
        }
        if let Some(port) = lookup("HEALTH_PORT") {
            config.service.health_port = parse_var("HEALTH_PORT", &port)?;
        }
        if let Some(timeout) = lookup("SHUTDOWN_TIMEOUT_SECONDS") {
            config.service.shutdown_timeout_seconds =
                parse_var("SHUTDOWN_TIMEOUT_SECONDS", &timeout)?;
        }

        // Storage settings
        if let Some(backend) = lookup("STORAGE_BACKEND") {
            config.storage.backend = backend.parse()?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            // A database URL without an explicit backend means postgres
            if lookup("STORAGE_BACKEND").is_none() {
                config.storage.backend = StorageBackend::Postgres;
            }
            config.storage.database_url = Some(url);
        }
        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.storage.max_connections = parse_var("DATABASE_MAX_CONNECTIONS", &max)?;
        }
        if let Some(timeout) = lookup("DATABASE_CONNECT_TIMEOUT_SECONDS") {
            config.storage.connect_timeout_seconds =
                parse_var("DATABASE_CONNECT_TIMEOUT_SECONDS", &timeout)?;
        }

        // Matchmaking settings
        if let Some(tick) = lookup("TICK_INTERVAL_MS") {
            config.matchmaking.tick_interval_ms = parse_var("TICK_INTERVAL_MS", &tick)?;
        }
        if let Some(wait) = lookup("WAIT_TIMEOUT_SECONDS") {
            config.matchmaking.wait_timeout_seconds = parse_var("WAIT_TIMEOUT_SECONDS", &wait)?;
        }
        if let Some(grace) = lookup("DELIVERY_GRACE_MS") {
            config.matchmaking.delivery_grace_ms = parse_var("DELIVERY_GRACE_MS", &grace)?;
        }
        if let Some(pairs) = lookup("MAX_PAIRS_PER_TICK") {
            config.matchmaking.max_pairs_per_tick = parse_var("MAX_PAIRS_PER_TICK", &pairs)?;
        }
        if let Some(stale) = lookup("STALE_ENTRY_SECONDS") {
            config.matchmaking.stale_entry_seconds = parse_var("STALE_ENTRY_SECONDS", &stale)?;
        }
        if let Some(cleanup) = lookup("CLEANUP_INTERVAL_SECONDS") {
            config.matchmaking.cleanup_interval_seconds =
                parse_var("CLEANUP_INTERVAL_SECONDS", &cleanup)?;
        }

        validate_config(&config)?;
        Ok(config)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get database connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.storage.connect_timeout_seconds)
    }
}

/// Longest age a queue entry may reach before the reaper removes it (30 days)
pub const MAX_STALE_ENTRY_SECONDS: u64 = 30 * 24 * 3600;

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    // Validate ports
    if config.service.http_port == 0 {
        return Err(anyhow!("HTTP port cannot be 0"));
    }
    if config.service.health_port == 0 {
        return Err(anyhow!("Health port cannot be 0"));
    }
    if config.service.http_port == config.service.health_port {
        return Err(anyhow!(
            "HTTP port and health port must differ (both {})",
            config.service.http_port
        ));
    }

    // Validate timeouts
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }

    // Validate storage settings
    if config.storage.backend == StorageBackend::Postgres {
        match config.storage.database_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(anyhow!("Postgres backend requires a database URL")),
        }
        if config.storage.max_connections == 0 {
            return Err(anyhow!("Database max connections must be greater than 0"));
        }
        if config.storage.connect_timeout_seconds == 0 {
            return Err(anyhow!("Database connect timeout must be greater than 0"));
        }
    }

    // Validate matchmaking settings
    let matchmaking = &config.matchmaking;
    if matchmaking.tick_interval_ms == 0 {
        return Err(anyhow!("Tick interval must be greater than 0"));
    }
    if matchmaking.wait_timeout_seconds == 0 {
        return Err(anyhow!("Wait timeout must be greater than 0"));
    }
    if matchmaking.max_pairs_per_tick == 0 {
        return Err(anyhow!("Max pairs per tick must be at least 1"));
    }
    if matchmaking.cleanup_interval_seconds == 0 {
        return Err(anyhow!("Cleanup interval must be greater than 0"));
    }
    if matchmaking.stale_entry_seconds > MAX_STALE_ENTRY_SECONDS {
        return Err(anyhow!(
            "Stale entry age ({}s) must not exceed {}s",
            matchmaking.stale_entry_seconds,
            MAX_STALE_ENTRY_SECONDS
        ));
    }
    if matchmaking.stale_entry_seconds <= matchmaking.wait_timeout_seconds {
        return Err(anyhow!(
            "Stale entry age ({}s) must exceed the wait timeout ({}s)",
            matchmaking.stale_entry_seconds,
            matchmaking.wait_timeout_seconds
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.matchmaking.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.matchmaking.wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.matchmaking.delivery_grace(), Duration::from_secs(5));
        assert_eq!(config.matchmaking.max_pairs_per_tick, 1);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("LOG_LEVEL", "debug"),
            ("HTTP_PORT", "8181"),
            ("TICK_INTERVAL_MS", "250"),
            ("WAIT_TIMEOUT_SECONDS", "10"),
            ("DATABASE_URL", "postgres://localhost/duel"),
        ]))
        .unwrap();

        assert_eq!(config.service.log_level, "debug");
        assert_eq!(config.service.http_port, 8181);
        assert_eq!(config.matchmaking.tick_interval_ms, 250);
        assert_eq!(config.matchmaking.wait_timeout_seconds, 10);
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(
            config.storage.database_url.as_deref(),
            Some("postgres://localhost/duel")
        );
    }

    #[test]
    fn test_explicit_backend_wins_over_database_url() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("STORAGE_BACKEND", "memory"),
            ("DATABASE_URL", "postgres://localhost/duel"),
        ]))
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = AppConfig::from_lookup(lookup_from(&[("HTTP_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("HTTP_PORT"));
    }

    #[test]
    fn test_partial_toml() {
        let config = AppConfig::from_toml_str(
            r#"
            [service]
            log_level = "warn"

            [matchmaking]
            max_pairs_per_tick = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.service.log_level, "warn");
        assert_eq!(config.service.http_port, 8080);
        assert_eq!(config.matchmaking.max_pairs_per_tick, 4);
        assert_eq!(config.matchmaking.wait_timeout_seconds, 30);
    }

    #[test]
    fn test_toml_postgres_backend() {
        let config = AppConfig::from_toml_str(
            r#"
            [storage]
            backend = "postgres"
            database_url = "postgres://duel:duel@db/duel"
            max_connections = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.max_connections, 20);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.service.log_level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Postgres;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.stale_entry_seconds = config.matchmaking.wait_timeout_seconds;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.stale_entry_seconds = u64::MAX;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.stale_entry_seconds = MAX_STALE_ENTRY_SECONDS;
        assert!(validate_config(&config).is_ok());

        let mut config = AppConfig::default();
        config.matchmaking.max_pairs_per_tick = 0;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.service.health_port = config.service.http_port;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!(
            "Postgres".parse::<StorageBackend>().unwrap(),
            StorageBackend::Postgres
        );
        assert_eq!(
            "memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert!("redis".parse::<StorageBackend>().is_err());
    }
}
