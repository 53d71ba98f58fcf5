//! Test fixtures for integration testing against the in-memory store

#![allow(dead_code)]

use room_matchmaker::config::{MatchmakingSettings, RegistrySettings, RoomDefinition};
use room_matchmaker::queue::{PendingResponse, RequestQueue, ResponseChannel};
use room_matchmaker::record::{ProcessRecord, RoomRecord};
use room_matchmaker::registry::Registry;
use room_matchmaker::scheduler::{Matchmaker, MatchmakingScheduler};
use room_matchmaker::store::{MemoryStore, StoreBackend};
use room_matchmaker::types::{ClientOptions, MatchMethod, MatchRequest};
use std::sync::Arc;

/// Registry settings isolating a test run
pub fn test_registry_settings() -> RegistrySettings {
    RegistrySettings {
        key_prefix: "testcaches".to_string(),
        queue_key: "testcaches:requests".to_string(),
        response_topic_prefix: "testcaches:matches".to_string(),
        ..Default::default()
    }
}

/// Scheduler settings with one `arena` definition of the given capacity
pub fn arena_settings(max_clients: u32) -> MatchmakingSettings {
    MatchmakingSettings {
        tick_interval_ms: 10,
        rooms: vec![RoomDefinition::new("arena").with_max_clients(max_clients)],
        ..Default::default()
    }
}

pub fn memory_registry() -> (Arc<MemoryStore>, Registry) {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), &test_registry_settings());
    (store, registry)
}

pub fn room(room_id: &str, process_id: &str, clients: u32, max_clients: u32) -> RoomRecord {
    RoomRecord::new("arena", process_id)
        .with_room_id(room_id)
        .with_clients(clients)
        .with_max_clients(max_clients)
}

pub fn process(process_id: &str, port: u16) -> ProcessRecord {
    ProcessRecord::new(process_id, format!("127.0.0.1:{}", port))
}

/// Load a process with `score` points by giving it a full, ineligible room
pub async fn seed_score(registry: &Registry, process_id: &str, score: u32) {
    let ballast = RoomRecord::new("ballast", process_id)
        .with_room_id(format!("ballast-{}", process_id))
        .with_clients(score)
        .with_max_clients(score);
    registry.create_room(&ballast).await.unwrap();
}

/// Every component wired over one in-memory store
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<Registry>,
    pub queue: Arc<RequestQueue>,
    pub responses: Arc<ResponseChannel>,
    pub scheduler: Arc<MatchmakingScheduler>,
    pub matchmaker: Arc<Matchmaker>,
}

impl TestHarness {
    pub async fn new(settings: MatchmakingSettings) -> Self {
        let registry_settings = test_registry_settings();
        let store = Arc::new(MemoryStore::new());
        let backend: Arc<dyn StoreBackend> = store.clone();

        let registry = Arc::new(Registry::new(backend.clone(), &registry_settings));
        let queue = Arc::new(RequestQueue::new(
            backend.clone(),
            registry_settings.queue_key.clone(),
        ));
        let responses = Arc::new(
            ResponseChannel::new(backend, registry_settings.response_topic_prefix.clone())
                .await
                .unwrap(),
        );

        let scheduler = Arc::new(
            MatchmakingScheduler::new(
                registry.clone(),
                queue.clone(),
                responses.clone(),
                settings.clone(),
            )
            .unwrap(),
        );
        let matchmaker = Arc::new(
            Matchmaker::new(registry.clone(), queue.clone(), responses.clone(), settings)
                .unwrap(),
        );

        Self {
            store,
            registry,
            queue,
            responses,
            scheduler,
            matchmaker,
        }
    }

    pub async fn with_processes(settings: MatchmakingSettings, processes: &[&str]) -> Self {
        let harness = Self::new(settings).await;
        for (i, process_id) in processes.iter().enumerate() {
            harness
                .registry
                .register_process(&process(process_id, 2567 + i as u16))
                .await
                .unwrap();
        }
        harness
    }

    /// Put a request on the queue with its waiter registered, without ticking
    pub async fn enqueue(&self, method: MatchMethod, room_name_or_id: &str) -> PendingResponse {
        self.enqueue_with(method, room_name_or_id, ClientOptions::new())
            .await
    }

    pub async fn enqueue_with(
        &self,
        method: MatchMethod,
        room_name_or_id: &str,
        options: ClientOptions,
    ) -> PendingResponse {
        let request = MatchRequest::new(method, room_name_or_id, options, None);
        let pending = self.responses.register(&request.request_id).unwrap();
        self.queue.enqueue(&request).await.unwrap();
        pending
    }
}
