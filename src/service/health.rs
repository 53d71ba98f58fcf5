//! Health checks and readiness/liveness probes

use crate::queue::ResponseChannel;
use crate::registry::ProcessFilter;
use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
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

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Set when the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub backend: String,
    pub eligible_rooms: usize,
    pub processes: usize,
    pub pending_responses: usize,
    pub uptime_info: String,
}

impl HealthCheck {
    /// Check every component and gather statistics
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let mut checks = vec![
            Self::check_service_running(&app_state).await,
            Self::check_registry(&app_state).await,
        ];
        checks.push(Self::check_response_channel(&app_state));

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |overall, check| {
                match (overall, check.status) {
                    (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                        HealthStatus::Unhealthy
                    }
                    (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => {
                        HealthStatus::Degraded
                    }
                    _ => HealthStatus::Healthy,
                }
            });

        for check in &checks {
            app_state
                .metrics()
                .update_component_health(&check.name, check.status != HealthStatus::Unhealthy);
        }

        let stats = Self::gather_service_stats(&app_state).await;

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Liveness: the service has started and not shut down
    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if app_state.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness: running, responses flowing and the registry backend answers
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await || !app_state.responses().is_active() {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(Self::check_registry(&app_state).await.status)
    }

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

    /// Round-trip to the backend with a cheap read
    async fn check_registry(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();
        let registry = app_state.registry();

        let (status, message) = match registry.store().members(&registry.keys().room_ids()).await
        {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Registry backend check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Registry backend unreachable: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "registry_backend".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_response_channel(app_state: &AppState) -> ComponentCheck {
        let start = std::time::Instant::now();
        let (status, message) = response_channel_status(&app_state.responses());

        ComponentCheck {
            name: "response_channel".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let registry = app_state.registry();

        let eligible_rooms = match registry.eligible_rooms().await {
            Ok(rooms) => rooms.len(),
            Err(e) => {
                debug!("Failed to count eligible rooms for health check: {}", e);
                0
            }
        };
        let processes = match registry.query_processes(&ProcessFilter::new()).await {
            Ok(processes) => processes.len(),
            Err(e) => {
                debug!("Failed to count processes for health check: {}", e);
                0
            }
        };

        ServiceStats {
            backend: registry.store().name().to_string(),
            eligible_rooms,
            processes,
            pending_responses: app_state.responses().pending_count().unwrap_or(0),
            uptime_info: format!("{}s", app_state.uptime().as_secs()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

/// Many callers waiting at once usually means the scheduler is behind
fn response_channel_status(responses: &ResponseChannel) -> (HealthStatus, Option<String>) {
    if !responses.is_active() {
        return (
            HealthStatus::Unhealthy,
            Some("response subscription closed".to_string()),
        );
    }
    match responses.pending_count() {
        Ok(pending) if pending > 10_000 => (
            HealthStatus::Degraded,
            Some(format!("{} callers awaiting responses", pending)),
        ),
        Ok(_) => (HealthStatus::Healthy, None),
        Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
    }
}
