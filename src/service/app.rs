//! Application state and lifecycle management
//!
//! Wires the store backend, registry, queue, response channel, scheduler
//! and metrics together and runs the background tasks.

use crate::config::{validate_config, AppConfig};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector, MetricsService};
use crate::queue::{RequestQueue, ResponseChannel};
use crate::registry::Registry;
use crate::scheduler::{Matchmaker, MatchmakingScheduler};
use crate::store::{self, StoreBackend};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Interval of the service metrics refresh task
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Registry backend error: {message}")]
    Backend { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    store: Arc<dyn StoreBackend>,
    registry: Arc<Registry>,
    queue: Arc<RequestQueue>,
    responses: Arc<ResponseChannel>,
    scheduler: Arc<MatchmakingScheduler>,
    matchmaker: Arc<Matchmaker>,
    metrics: Arc<MetricsCollector>,
    metrics_service: Mutex<Option<MetricsService>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl AppState {
    /// Connect the configured backend and build every component
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        info!(
            "Initializing {} with {} registry backend",
            config.service.name, config.registry.backend
        );

        let metrics = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let store = store::connect(&config.registry)
            .await
            .map_err(|e| ServiceError::Backend {
                message: format!("Failed to connect registry backend: {}", e),
            })?;

        let registry = Arc::new(
            Registry::new(store.clone(), &config.registry).with_metrics(metrics.clone()),
        );
        let queue = Arc::new(
            RequestQueue::new(store.clone(), config.registry.queue_key.clone())
                .with_metrics(metrics.clone()),
        );
        let responses = Arc::new(
            ResponseChannel::new(store.clone(), config.registry.response_topic_prefix.clone())
                .await
                .map_err(|e| ServiceError::Backend {
                    message: format!("Failed to subscribe to responses: {}", e),
                })?
                .with_metrics(metrics.clone()),
        );

        let configuration_error = |e: anyhow::Error| ServiceError::Configuration {
            message: e.to_string(),
        };
        let scheduler = Arc::new(
            MatchmakingScheduler::new(
                registry.clone(),
                queue.clone(),
                responses.clone(),
                config.matchmaking.clone(),
            )
            .map_err(configuration_error)?
            .with_metrics(metrics.clone()),
        );
        let matchmaker = Arc::new(
            Matchmaker::new(
                registry.clone(),
                queue.clone(),
                responses.clone(),
                config.matchmaking.clone(),
            )
            .map_err(configuration_error)?,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store,
            registry,
            queue,
            responses,
            scheduler,
            matchmaker,
            metrics,
            metrics_service: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Start the health server, the tick loop and metrics refresh
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting {}", self.config.service.name);
        *self.is_running.write().await = true;

        let health_server = Arc::new(
            HealthServer::new(
                HealthServerConfig {
                    port: self.config.service.health_port,
                    host: "0.0.0.0".to_string(),
                },
                self.metrics.clone(),
            )
            .with_app_state(self.clone()),
        );
        let metrics_service = MetricsService::new(self.metrics.clone(), health_server);

        let mut tasks = Vec::new();

        let service = metrics_service.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = service.start().await {
                error!("Metrics service failed: {}", e);
            }
        }));

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }));

        tasks.push(self.spawn_metrics_refresh());

        self.lock_tasks()?.extend(tasks);
        *self
            .metrics_service
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "Failed to acquire metrics service lock".to_string(),
            })? = Some(metrics_service);

        info!(
            "{} started, health endpoints on port {}",
            self.config.service.name, self.config.service.health_port
        );
        Ok(())
    }

    fn spawn_metrics_refresh(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let is_running = self.is_running.clone();
        let started_at = self.started_at;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics
                            .service()
                            .uptime_seconds
                            .set(started_at.elapsed().as_secs() as i64);
                        let healthy = *is_running.read().await;
                        metrics.update_health_status(if healthy { 2 } else { 0 });
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>, ServiceError> {
        self.background_tasks
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "Failed to acquire background task lock".to_string(),
            })
    }

    /// Stop background tasks and the health server
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        *self.is_running.write().await = false;

        if self.shutdown_tx.send(()).is_err() {
            warn!("No background task was listening for shutdown");
        }

        let metrics_service = self
            .metrics_service
            .lock()
            .map_err(|_| ServiceError::BackgroundTask {
                message: "Failed to acquire metrics service lock".to_string(),
            })?
            .take();
        if let Some(service) = metrics_service {
            if let Err(e) = service.stop().await {
                warn!("Failed to stop metrics service: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.lock_tasks()?.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not stop within 5s");
            }
        }

        info!(
            "{} stopped, {} responses still pending",
            self.config.service.name,
            self.responses.pending_count().unwrap_or(0)
        );
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn store(&self) -> Arc<dyn StoreBackend> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn queue(&self) -> Arc<RequestQueue> {
        self.queue.clone()
    }

    pub fn responses(&self) -> Arc<ResponseChannel> {
        self.responses.clone()
    }

    pub fn scheduler(&self) -> Arc<MatchmakingScheduler> {
        self.scheduler.clone()
    }

    pub fn matchmaker(&self) -> Arc<Matchmaker> {
        self.matchmaker.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryMode;

    #[tokio::test]
    async fn test_new_with_memory_backend() {
        let state = AppState::new(AppConfig::default()).await.unwrap();
        assert!(!state.is_running().await);
        assert_eq!(state.store().name(), "memory");
    }

    #[tokio::test]
    async fn test_local_mode_is_rejected() {
        let mut config = AppConfig::default();
        config.registry.mode = RegistryMode::Local;

        let result = AppState::new(config).await;
        assert!(matches!(result, Err(ServiceError::Configuration { .. })));
    }
}
