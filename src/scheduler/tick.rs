//! Batch matchmaking scheduler

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::MatchmakingSettings;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::queue::{RequestQueue, ResponseChannel};
use crate::registry::{ProcessFilter, Registry};
use crate::scheduler::resolve::{announce_assignment, Resolver};
use crate::scheduler::snapshot::TickSnapshot;
use crate::types::{MatchOutcome, MatchRequest, ResolvedMethod};

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub drained: usize,
    /// Join and joinById resolutions
    pub joined: usize,
    pub created: usize,
    pub reconnected: usize,
    pub failed: usize,
    /// Eligible rooms in the snapshot before any assignment
    pub rooms: usize,
    pub processes: usize,
    pub duration: Duration,
}

impl TickReport {
    pub fn resolved(&self) -> usize {
        self.drained - self.failed
    }
}

/// The single active consumer of the request queue
pub struct MatchmakingScheduler {
    registry: Arc<Registry>,
    queue: Arc<RequestQueue>,
    responses: Arc<ResponseChannel>,
    settings: MatchmakingSettings,
    process_filter: ProcessFilter,
    metrics: Option<Arc<MetricsCollector>>,
}

impl MatchmakingScheduler {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<RequestQueue>,
        responses: Arc<ResponseChannel>,
        settings: MatchmakingSettings,
    ) -> Result<Self> {
        if registry.is_local() {
            return Err(MatchmakingError::ConfigurationError {
                message: "the matchmaking scheduler needs a shared registry, not one in local mode"
                    .to_string(),
            }
            .into());
        }

        let process_filter = ProcessFilter::from_conditions(settings.process_filter.clone());
        Ok(Self {
            registry,
            queue,
            responses,
            settings,
            process_filter,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &MatchmakingSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Eligible rooms and unlocked, filtered processes, least loaded first
    pub async fn load_snapshot(&self) -> Result<TickSnapshot> {
        let rooms = self.registry.eligible_rooms().await?;
        let processes = self.registry.query_processes(&self.process_filter).await?;
        Ok(TickSnapshot::new(rooms, processes))
    }

    /// Drain the queue and answer every drained request
    pub async fn tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let requests = self.queue.drain().await?;
        let mut report = TickReport {
            drained: requests.len(),
            ..Default::default()
        };

        if requests.is_empty() {
            report.duration = started.elapsed();
            self.record(&report);
            return Ok(report);
        }

        let mut snapshot = match self.load_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // drained requests must still get an answer
                error!("Failed to load tick snapshot: {}", e);
                let outcome = MatchOutcome::failure(&e);
                for request in &requests {
                    self.respond(request, &outcome).await;
                }
                return Err(e);
            }
        };
        report.rooms = snapshot.rooms().len();
        report.processes = snapshot.processes().len();

        let resolver = Resolver::new(&self.registry, &self.settings);
        for request in &requests {
            let outcome = match resolver
                .resolve(
                    &mut snapshot,
                    request.method,
                    &request.room_name_or_id,
                    &request.client_options,
                )
                .await
            {
                Ok(resolution) => {
                    match resolution.response.method {
                        ResolvedMethod::Create => report.created += 1,
                        ResolvedMethod::Join | ResolvedMethod::JoinById => report.joined += 1,
                        ResolvedMethod::Reconnect => report.reconnected += 1,
                    }
                    if let Some(room) = &resolution.created {
                        announce_assignment(
                            &self.registry,
                            Some(&request.request_id),
                            room,
                            &request.client_options,
                        )
                        .await;
                    }
                    debug!(
                        "Request {} ({}) resolved to {} room {} on {}",
                        request.request_id,
                        request.method,
                        resolution.response.method,
                        resolution.response.room_id,
                        resolution.response.process_id
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_resolution(resolution.response.method.as_str(), true);
                    }
                    MatchOutcome::Success(resolution.response)
                }
                Err(e) => {
                    report.failed += 1;
                    debug!(
                        "Request {} ({} '{}') failed: {}",
                        request.request_id, request.method, request.room_name_or_id, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_resolution(request.method.as_str(), false);
                    }
                    MatchOutcome::failure(&e)
                }
            };

            self.respond(request, &outcome).await;
        }

        report.duration = started.elapsed();
        self.record(&report);
        info!(
            "Tick resolved {} requests ({} joined, {} created, {} reconnected, {} failed) in {:?}",
            report.drained,
            report.joined,
            report.created,
            report.reconnected,
            report.failed,
            report.duration
        );
        Ok(report)
    }

    async fn respond(&self, request: &MatchRequest, outcome: &MatchOutcome) {
        if let Err(e) = self.responses.publish(&request.request_id, outcome).await {
            error!(
                "Failed to publish response for request {}: {}",
                request.request_id, e
            );
        }
    }

    fn record(&self, report: &TickReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_tick(
                report.drained,
                report.rooms,
                report.processes,
                report.duration,
            );
        }
    }

    /// Tick on the configured interval until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Matchmaking scheduler running every {:?}",
            self.settings.tick_interval()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Matchmaking tick failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Matchmaking scheduler stopping");
                    break;
                }
            }
        }
    }
}
