//! Matchmaker front door used by API nodes

use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::config::MatchmakingSettings;
use crate::error::{MatchmakingError, Result};
use crate::queue::{RequestQueue, ResponseChannel};
use crate::registry::{ProcessFilter, Registry};
use crate::scheduler::resolve::{announce_assignment, Resolver};
use crate::scheduler::routing::{MethodRouting, Route};
use crate::scheduler::snapshot::TickSnapshot;
use crate::types::{ClientOptions, MatchMethod, MatchRequest, MatchResponse, ProcessAssignment};

/// Assignments addressed to one process
pub type AssignmentStream = Pin<Box<dyn Stream<Item = ProcessAssignment> + Send>>;

pub struct Matchmaker {
    registry: Arc<Registry>,
    queue: Arc<RequestQueue>,
    responses: Arc<ResponseChannel>,
    settings: MatchmakingSettings,
    routing: MethodRouting,
    process_filter: ProcessFilter,
}

impl Matchmaker {
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<RequestQueue>,
        responses: Arc<ResponseChannel>,
        settings: MatchmakingSettings,
    ) -> Result<Self> {
        if registry.is_local() {
            return Err(MatchmakingError::ConfigurationError {
                message: "queued matchmaking needs a shared registry, not one in local mode"
                    .to_string(),
            }
            .into());
        }

        Ok(Self {
            routing: MethodRouting::from_create_behavior(settings.create_behavior),
            process_filter: ProcessFilter::from_conditions(settings.process_filter.clone()),
            registry,
            queue,
            responses,
            settings,
        })
    }

    pub fn with_routing(mut self, routing: MethodRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn routing(&self) -> &MethodRouting {
        &self.routing
    }

    /// Resolve a client call through the queue or directly, per routing
    pub async fn invoke(
        &self,
        method: MatchMethod,
        room_name_or_id: &str,
        client_options: ClientOptions,
        auth_options: Option<serde_json::Value>,
    ) -> Result<MatchResponse> {
        match self.routing.route(method)? {
            Route::Queue => {
                self.queue_method(method, room_name_or_id, client_options, auth_options)
                    .await
            }
            Route::Dispatch => {
                self.dispatch_method(method, room_name_or_id, &client_options)
                    .await
            }
        }
    }

    /// Enqueue a request and wait for the scheduler's answer
    pub async fn queue_method(
        &self,
        method: MatchMethod,
        room_name_or_id: &str,
        client_options: ClientOptions,
        auth_options: Option<serde_json::Value>,
    ) -> Result<MatchResponse> {
        let request = MatchRequest::new(method, room_name_or_id, client_options, auth_options);
        // the waiter exists before the scheduler can see the request
        let pending = self.responses.register(&request.request_id)?;
        self.queue.enqueue(&request).await?;
        pending.wait().await
    }

    /// Resolve against current registry state without queueing
    pub async fn dispatch_method(
        &self,
        method: MatchMethod,
        room_name_or_id: &str,
        client_options: &ClientOptions,
    ) -> Result<MatchResponse> {
        let mut snapshot = match method {
            MatchMethod::JoinById | MatchMethod::Reconnect => TickSnapshot::default(),
            _ => {
                let rooms = self.registry.eligible_rooms().await?;
                let processes = self.registry.query_processes(&self.process_filter).await?;
                TickSnapshot::new(rooms, processes)
            }
        };

        let resolver = Resolver::new(&self.registry, &self.settings);
        let resolution = resolver
            .resolve(&mut snapshot, method, room_name_or_id, client_options)
            .await?;

        if let Some(room) = &resolution.created {
            announce_assignment(&self.registry, None, room, client_options).await;
        }
        debug!(
            "Dispatched {} '{}' to room {} on {}",
            method,
            room_name_or_id,
            resolution.response.room_id,
            resolution.response.process_id
        );
        Ok(resolution.response)
    }

    /// Rooms the matchmaker asks `process_id` to create
    pub async fn process_assignments(&self, process_id: &str) -> Result<AssignmentStream> {
        let topic = self.registry.keys().process_topic(process_id);
        let notifications = self.registry.store().subscribe_prefix(&topic).await?;

        let stream = notifications.filter_map(move |notification| {
            if notification.topic != topic {
                return None;
            }
            match serde_json::from_str::<ProcessAssignment>(&notification.payload) {
                Ok(assignment) => Some(assignment),
                Err(e) => {
                    warn!("Ignoring malformed assignment on {}: {}", topic, e);
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
