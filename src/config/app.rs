//! Main application configuration
//!
//! This module defines the primary configuration structures for the
//! room-matchmaker service, including TOML and environment variable loading
//! and validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::config::matchmaking::MatchmakingSettings;
use crate::config::registry::{RegistryBackend, RegistrySettings};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub registry: RegistrySettings,
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
    /// Port for health check endpoint
    pub health_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "room-matchmaker".to_string(),
            log_level: "info".to_string(),
            health_port: 8080,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        if let Ok(port) = env::var("HEALTH_PORT") {
            self.service.health_port = port
                .parse()
                .map_err(|_| anyhow!("Invalid HEALTH_PORT value: {}", port))?;
        }
        if let Ok(timeout) = env::var("SHUTDOWN_TIMEOUT_SECONDS") {
            self.service.shutdown_timeout_seconds = timeout
                .parse()
                .map_err(|_| anyhow!("Invalid SHUTDOWN_TIMEOUT_SECONDS value: {}", timeout))?;
        }

        // Registry settings
        if let Ok(backend) = env::var("REGISTRY_BACKEND") {
            self.registry.backend = backend.parse()?;
        }
        if let Ok(url) = env::var("REGISTRY_URL") {
            self.registry.url = Some(url);
        }
        if let Ok(prefix) = env::var("REGISTRY_KEY_PREFIX") {
            self.registry.key_prefix = prefix;
        }
        if let Ok(queue) = env::var("REGISTRY_QUEUE_KEY") {
            self.registry.queue_key = queue;
        }
        if let Ok(topic) = env::var("RESPONSE_TOPIC_PREFIX") {
            self.registry.response_topic_prefix = topic;
        }
        if let Ok(mode) = env::var("REGISTRY_MODE") {
            self.registry.mode = mode.parse()?;
        }

        // Matchmaking settings
        if let Ok(interval) = env::var("TICK_INTERVAL_MS") {
            self.matchmaking.tick_interval_ms = interval
                .parse()
                .map_err(|_| anyhow!("Invalid TICK_INTERVAL_MS value: {}", interval))?;
        }
        if let Ok(behavior) = env::var("CREATE_BEHAVIOR") {
            self.matchmaking.create_behavior = behavior.parse()?;
        }
        if let Ok(target) = env::var("TARGET_ROOMS_PER_PROCESS") {
            self.matchmaking.target_rooms_per_process = Some(
                target
                    .parse()
                    .map_err(|_| anyhow!("Invalid TARGET_ROOMS_PER_PROCESS value: {}", target))?,
            );
        }
        if let Ok(max_clients) = env::var("DEFAULT_MAX_CLIENTS") {
            self.matchmaking.default_max_clients = Some(
                max_clients
                    .parse()
                    .map_err(|_| anyhow!("Invalid DEFAULT_MAX_CLIENTS value: {}", max_clients))?,
            );
        }

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get scheduler tick interval as Duration
    pub fn tick_interval(&self) -> Duration {
        self.matchmaking.tick_interval()
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    // Validate ports
    if config.service.health_port == 0 {
        return Err(anyhow!("Health port cannot be 0"));
    }

    // Validate timeouts
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }
    if config.matchmaking.tick_interval_ms == 0 {
        return Err(anyhow!("Tick interval must be greater than 0"));
    }

    // Validate registry settings
    if config.registry.key_prefix.is_empty() {
        return Err(anyhow!("Registry key prefix cannot be empty"));
    }
    if config.registry.queue_key.is_empty() {
        return Err(anyhow!("Registry queue key cannot be empty"));
    }
    if config.registry.response_topic_prefix.is_empty() {
        return Err(anyhow!("Response topic prefix cannot be empty"));
    }
    if config.registry.backend != RegistryBackend::Memory
        && config.registry.url.as_deref().unwrap_or("").is_empty()
    {
        return Err(anyhow!(
            "Registry backend {:?} requires a url",
            config.registry.backend
        ));
    }
    for entry in &config.registry.metadata_schema {
        if entry.field.is_empty() {
            return Err(anyhow!("Metadata schema field names cannot be empty"));
        }
        // ':' separates field name and value in index keys
        if entry.field.contains(':') {
            return Err(anyhow!(
                "Metadata schema field '{}' cannot contain ':'",
                entry.field
            ));
        }
    }

    // Validate matchmaking settings
    if config.matchmaking.target_rooms_per_process == Some(0) {
        return Err(anyhow!("Target rooms per process must be greater than 0"));
    }
    for room in &config.matchmaking.rooms {
        if room.name.is_empty() {
            return Err(anyhow!("Room definitions require a name"));
        }
        if room.max_clients == Some(0) {
            return Err(anyhow!("Room '{}' max_clients must be greater than 0", room.name));
        }
    }

    Ok(())
}
