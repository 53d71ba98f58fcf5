//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the room-matchmaker service
//! using Prometheus metrics.

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Room registry metrics
    registry_metrics: RegistryMetrics,

    /// Request queue and response channel metrics
    queue_metrics: QueueMetrics,

    /// Scheduler tick metrics
    scheduler_metrics: SchedulerMetrics,
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

/// Registry write metrics
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Record writes by operation and status
    pub writes_total: IntCounterVec,

    /// Guard conflicts that forced a write to be retried
    pub index_conflicts_total: IntCounter,

    /// Rooms removed by a process cleanup cascade
    pub rooms_cleaned_total: IntCounter,

    /// Registry write durations
    pub write_duration: HistogramVec,
}

/// Request queue and response channel metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Requests enqueued by method
    pub requests_enqueued_total: IntCounterVec,

    /// Resolved requests by resolved method and outcome
    pub resolutions_total: IntCounterVec,

    /// Requests that hit the response deadline
    pub response_timeouts_total: IntCounter,

    /// Callers currently awaiting a response
    pub pending_responses: IntGauge,
}

/// Scheduler metrics
#[derive(Clone)]
pub struct SchedulerMetrics {
    /// Completed ticks
    pub ticks_total: IntCounter,

    /// Tick duration
    pub tick_duration: Histogram,

    /// Requests drained by the most recent tick
    pub last_drain_size: IntGauge,

    /// Eligible rooms in the most recent snapshot
    pub snapshot_rooms: IntGauge,

    /// Processes in the most recent snapshot
    pub snapshot_processes: IntGauge,
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
        let registry_metrics = RegistryMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let scheduler_metrics = SchedulerMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            registry_metrics,
            queue_metrics,
            scheduler_metrics,
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

    /// Get room registry metrics
    pub fn room_registry(&self) -> &RegistryMetrics {
        &self.registry_metrics
    }

    /// Get queue metrics
    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    /// Get scheduler metrics
    pub fn scheduler(&self) -> &SchedulerMetrics {
        &self.scheduler_metrics
    }

    /// Record a registry write
    pub fn record_registry_write(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        self.registry_metrics
            .writes_total
            .with_label_values(&[operation, status])
            .inc();
        self.registry_metrics
            .write_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_index_conflict(&self) {
        self.registry_metrics.index_conflicts_total.inc();
    }

    pub fn record_rooms_cleaned(&self, count: usize) {
        self.registry_metrics
            .rooms_cleaned_total
            .inc_by(count as u64);
    }

    pub fn record_enqueued(&self, method: &str) {
        self.queue_metrics
            .requests_enqueued_total
            .with_label_values(&[method])
            .inc();
    }

    /// Record a resolved request; `method` is the resolved method or `none`
    pub fn record_resolution(&self, method: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.queue_metrics
            .resolutions_total
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn record_response_timeout(&self) {
        self.queue_metrics.response_timeouts_total.inc();
    }

    pub fn set_pending_responses(&self, pending: usize) {
        self.queue_metrics.pending_responses.set(pending as i64);
    }

    /// Record a completed scheduler tick
    pub fn record_tick(&self, drained: usize, rooms: usize, processes: usize, duration: Duration) {
        self.scheduler_metrics.ticks_total.inc();
        self.scheduler_metrics
            .tick_duration
            .observe(duration.as_secs_f64());
        self.scheduler_metrics.last_drain_size.set(drained as i64);
        self.scheduler_metrics.snapshot_rooms.set(rooms as i64);
        self.scheduler_metrics
            .snapshot_processes
            .set(processes as i64);
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
            IntGauge::new("room_matchmaker_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "room_matchmaker_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("room_matchmaker_component_health", "Component health status"),
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

impl RegistryMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let writes_total = IntCounterVec::new(
            Opts::new("room_matchmaker_registry_writes_total", "Registry writes"),
            &["operation", "status"],
        )?;
        registry.register(Box::new(writes_total.clone()))?;

        let index_conflicts_total = IntCounter::new(
            "room_matchmaker_index_conflicts_total",
            "Registry writes retried after a concurrent change",
        )?;
        registry.register(Box::new(index_conflicts_total.clone()))?;

        let rooms_cleaned_total = IntCounter::new(
            "room_matchmaker_rooms_cleaned_total",
            "Rooms removed by process cleanup",
        )?;
        registry.register(Box::new(rooms_cleaned_total.clone()))?;

        let write_duration = HistogramVec::new(
            HistogramOpts::new(
                "room_matchmaker_registry_write_duration_seconds",
                "Registry write duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["operation"],
        )?;
        registry.register(Box::new(write_duration.clone()))?;

        Ok(Self {
            writes_total,
            index_conflicts_total,
            rooms_cleaned_total,
            write_duration,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests_enqueued_total = IntCounterVec::new(
            Opts::new(
                "room_matchmaker_requests_enqueued_total",
                "Matchmaking requests enqueued",
            ),
            &["method"],
        )?;
        registry.register(Box::new(requests_enqueued_total.clone()))?;

        let resolutions_total = IntCounterVec::new(
            Opts::new(
                "room_matchmaker_resolutions_total",
                "Matchmaking requests resolved",
            ),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(resolutions_total.clone()))?;

        let response_timeouts_total = IntCounter::new(
            "room_matchmaker_response_timeouts_total",
            "Queued requests that timed out waiting for a response",
        )?;
        registry.register(Box::new(response_timeouts_total.clone()))?;

        let pending_responses = IntGauge::new(
            "room_matchmaker_pending_responses",
            "Callers awaiting a response",
        )?;
        registry.register(Box::new(pending_responses.clone()))?;

        Ok(Self {
            requests_enqueued_total,
            resolutions_total,
            response_timeouts_total,
            pending_responses,
        })
    }
}

impl SchedulerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let ticks_total =
            IntCounter::new("room_matchmaker_ticks_total", "Completed scheduler ticks")?;
        registry.register(Box::new(ticks_total.clone()))?;

        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "room_matchmaker_tick_duration_seconds",
                "Scheduler tick duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        let last_drain_size = IntGauge::new(
            "room_matchmaker_last_drain_size",
            "Requests drained by the last tick",
        )?;
        registry.register(Box::new(last_drain_size.clone()))?;

        let snapshot_rooms = IntGauge::new(
            "room_matchmaker_snapshot_rooms",
            "Eligible rooms in the last tick snapshot",
        )?;
        registry.register(Box::new(snapshot_rooms.clone()))?;

        let snapshot_processes = IntGauge::new(
            "room_matchmaker_snapshot_processes",
            "Processes in the last tick snapshot",
        )?;
        registry.register(Box::new(snapshot_processes.clone()))?;

        Ok(Self {
            ticks_total,
            tick_duration,
            last_drain_size,
            snapshot_rooms,
            snapshot_processes,
        })
    }
}
