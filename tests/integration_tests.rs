//! Integration tests for the room matchmaker
//!
//! These tests drive the registry, queue, scheduler and matchmaker together
//! over the in-memory store:
//! - Registry writes keep queries and process scores consistent
//! - Queued requests are answered exactly once per tick
//! - Dispatched and queued failures reach the caller
//! - Owning processes hear about rooms they must create

mod fixtures;

use fixtures::{arena_settings, memory_registry, process, room, seed_score, TestHarness};
use futures::future::join_all;
use proptest::prelude::*;
use room_matchmaker::config::{CreateBehavior, RegistryMode};
use room_matchmaker::error::MatchmakingError;
use room_matchmaker::queue::ResponseChannel;
use room_matchmaker::registry::{Registry, RoomQuery};
use room_matchmaker::scheduler::{MatchmakingScheduler, Resolver};
use room_matchmaker::types::{ClientOptions, MatchMethod, MatchRequest, ResolvedMethod};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

fn error_of(err: &anyhow::Error) -> &MatchmakingError {
    err.downcast_ref::<MatchmakingError>()
        .expect("error should be a MatchmakingError")
}

#[tokio::test]
async fn test_saved_room_is_found_by_new_values_only() {
    let (_store, registry) = memory_registry();
    registry.register_process(&process("p1", 2567)).await.unwrap();
    registry.create_room(&room("r1", "p1", 1, 2)).await.unwrap();

    let eligible = registry.eligible_rooms().await.unwrap();
    assert_eq!(eligible.len(), 1);

    let mut full = registry.find_room("r1").await.unwrap().unwrap();
    full.clients = 2;
    registry.save_room(&full).await.unwrap();

    assert!(registry.eligible_rooms().await.unwrap().is_empty());
    let by_new = registry
        .query_rooms(&RoomQuery::new().eq("clients", 2.0))
        .await
        .unwrap();
    assert_eq!(by_new.len(), 1);
    assert_eq!(by_new[0].room_id, "r1");
    let by_old = registry
        .query_rooms(&RoomQuery::new().eq("clients", 1.0))
        .await
        .unwrap();
    assert!(by_old.is_empty());

    let p1 = registry.find_process("p1").await.unwrap().unwrap();
    assert_eq!(p1.score, 2.0);
}

#[tokio::test]
async fn test_removed_room_disappears_and_releases_score() {
    let (_store, registry) = memory_registry();
    registry.register_process(&process("p1", 2567)).await.unwrap();
    registry.create_room(&room("r1", "p1", 3, 8)).await.unwrap();
    registry.create_room(&room("r2", "p1", 1, 8)).await.unwrap();
    assert_eq!(registry.find_process("p1").await.unwrap().unwrap().score, 4.0);

    assert!(registry.remove_room("r1").await.unwrap());

    assert!(registry.find_room("r1").await.unwrap().is_none());
    let remaining = registry
        .query_rooms(&RoomQuery::new().eq("processId", "p1"))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].room_id, "r2");
    assert_eq!(registry.find_process("p1").await.unwrap().unwrap().score, 1.0);
}

#[tokio::test]
async fn test_cleanup_removes_every_room_of_a_process() {
    let (store, registry) = memory_registry();
    registry.register_process(&process("doomed", 2567)).await.unwrap();
    registry.register_process(&process("healthy", 2568)).await.unwrap();

    // more than one cleanup batch
    for i in 0..501 {
        registry
            .create_room(&room(&format!("d{}", i), "doomed", 1, 4))
            .await
            .unwrap();
    }
    registry.create_room(&room("h1", "healthy", 1, 4)).await.unwrap();

    let removed = registry.cleanup_process("doomed").await.unwrap();
    assert_eq!(removed, 501);

    assert!(registry.find_process("doomed").await.unwrap().is_none());
    let rooms = registry.eligible_rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].room_id, "h1");

    // no index entry may still name a removed room
    for (key, members) in store.set_snapshot().unwrap() {
        assert!(
            members.iter().all(|m| !m.starts_with('d')),
            "{} still holds removed rooms",
            key
        );
    }
}

#[tokio::test]
async fn test_concurrent_enqueue_and_drain_lose_nothing() {
    let harness = TestHarness::new(arena_settings(4)).await;
    let queue = harness.queue.clone();

    let enqueues = (0..200).map(|i| {
        let queue = queue.clone();
        async move {
            let request = MatchRequest::new(
                MatchMethod::JoinOrCreate,
                format!("room-{}", i),
                ClientOptions::new(),
                None,
            );
            queue.enqueue(&request).await.unwrap()
        }
    });
    let drains = (0..20).map(|_| {
        let queue = queue.clone();
        async move {
            tokio::task::yield_now().await;
            queue.drain().await.unwrap()
        }
    });

    let (enqueued, drained) = tokio::join!(join_all(enqueues), join_all(drains));
    let mut seen: Vec<String> = drained
        .into_iter()
        .flatten()
        .map(|request| request.request_id)
        .collect();
    seen.extend(
        harness
            .queue
            .drain()
            .await
            .unwrap()
            .into_iter()
            .map(|request| request.request_id),
    );

    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), 200, "every request drained exactly once");
    assert_eq!(unique, enqueued.into_iter().collect::<HashSet<_>>());
}

#[tokio::test]
async fn test_same_tick_requests_share_a_synthesized_room() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;

    let first = harness.enqueue(MatchMethod::JoinOrCreate, "arena").await;
    let second = harness.enqueue(MatchMethod::JoinOrCreate, "arena").await;

    let report = harness.scheduler.tick().await.unwrap();
    assert_eq!(report.drained, 2);
    assert_eq!(report.created, 1);
    assert_eq!(report.joined, 1);

    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    assert_eq!(first.method, ResolvedMethod::Create);
    assert_eq!(second.method, ResolvedMethod::Join);
    assert_eq!(first.room_id, second.room_id);
    assert_eq!(second.process_id, "p1");
    assert_eq!(second.settings.hostname, "127.0.0.1");
    assert_eq!(second.settings.port, Some(2567));
}

#[tokio::test]
async fn test_tick_spreads_creates_over_least_loaded_processes() {
    let harness = TestHarness::with_processes(arena_settings(1), &["busy", "idle"]).await;
    seed_score(&harness.registry, "busy", 5).await;

    let pending = vec![
        harness.enqueue(MatchMethod::Create, "arena").await,
        harness.enqueue(MatchMethod::Create, "arena").await,
    ];
    harness.scheduler.tick().await.unwrap();

    let mut placed = Vec::new();
    for waiter in pending {
        placed.push(waiter.wait().await.unwrap().process_id);
    }
    // the idle process absorbs creates until its charged score passes the busy one
    assert_eq!(placed, vec!["idle".to_string(), "idle".to_string()]);
}

#[tokio::test]
async fn test_dispatched_join_without_room_fails_synchronously() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;

    let err = harness
        .matchmaker
        .dispatch_method(MatchMethod::Join, "arena", &ClientOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(error_of(&err), MatchmakingError::NotFound { .. }));

    let err = harness
        .matchmaker
        .invoke(MatchMethod::JoinById, "missing", ClientOptions::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(error_of(&err), MatchmakingError::NotFound { .. }));
    assert_eq!(harness.responses.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_queued_failure_reaches_the_caller() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;

    let pending = harness.enqueue(MatchMethod::Join, "arena").await;
    let report = harness.scheduler.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(error_of(&err), MatchmakingError::NotFound { .. }));
}

#[tokio::test]
async fn test_queued_call_through_running_scheduler() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let ticker = tokio::spawn(harness.scheduler.clone().run(shutdown_tx.subscribe()));

    let response = harness
        .matchmaker
        .invoke(MatchMethod::JoinOrCreate, "arena", ClientOptions::new(), None)
        .await
        .unwrap();
    assert_eq!(response.method, ResolvedMethod::Create);
    assert_eq!(response.room_name, "arena");

    let _ = shutdown_tx.send(());
    ticker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_queued_call_times_out_without_scheduler() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;

    let started = tokio::time::Instant::now();
    let err = harness
        .matchmaker
        .invoke(MatchMethod::JoinOrCreate, "arena", ClientOptions::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(
        error_of(&err),
        MatchmakingError::Timeout { seconds: 15, .. }
    ));
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert_eq!(harness.responses.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_resolver_charges_snapshot_scores_and_clients() {
    let harness = TestHarness::with_processes(arena_settings(3), &["p1", "p2"]).await;
    harness
        .registry
        .create_room(&room("r1", "p1", 1, 3))
        .await
        .unwrap();

    let mut snapshot = harness.scheduler.load_snapshot().await.unwrap();
    assert_eq!(snapshot.process("p1").unwrap().score, 1.0);

    let resolver = Resolver::new(&harness.registry, harness.scheduler.settings());
    let options = ClientOptions::new();

    let joined = resolver
        .resolve(&mut snapshot, MatchMethod::Join, "arena", &options)
        .await
        .unwrap();
    assert_eq!(joined.response.room_id, "r1");
    assert_eq!(snapshot.room("r1").unwrap().clients, 2);
    assert_eq!(snapshot.process("p1").unwrap().score, 2.0);

    let created = resolver
        .resolve(&mut snapshot, MatchMethod::Create, "arena", &options)
        .await
        .unwrap();
    let room = created.created.expect("create synthesizes a room");
    assert_eq!(room.process_id, "p2");
    assert_eq!(room.clients, 1);
    assert_eq!(room.max_clients, 3);
    assert_eq!(snapshot.process("p2").unwrap().score, 1.0);
    assert_eq!(snapshot.synthesized_rooms(), 1);

    // the registry is untouched until the owning process persists the room
    assert!(harness
        .registry
        .find_room(&room.room_id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        harness.registry.find_process("p1").await.unwrap().unwrap().score,
        1.0
    );
}

#[tokio::test]
async fn test_join_by_id_rejects_locked_and_full_rooms() {
    let harness = TestHarness::with_processes(arena_settings(2), &["p1"]).await;
    let mut locked = room("locked", "p1", 1, 4);
    locked.locked = true;
    harness.registry.create_room(&locked).await.unwrap();
    harness
        .registry
        .create_room(&room("full", "p1", 2, 2))
        .await
        .unwrap();
    harness
        .registry
        .create_room(&room("open", "p1", 1, 2))
        .await
        .unwrap();

    for room_id in ["locked", "full"] {
        let err = harness
            .matchmaker
            .invoke(MatchMethod::JoinById, room_id, ClientOptions::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(error_of(&err), MatchmakingError::NotFound { .. }));
    }

    let response = harness
        .matchmaker
        .invoke(MatchMethod::JoinById, "open", ClientOptions::new(), None)
        .await
        .unwrap();
    assert_eq!(response.method, ResolvedMethod::JoinById);

    // reconnect ignores capacity
    let response = harness
        .matchmaker
        .invoke(MatchMethod::Reconnect, "full", ClientOptions::new(), None)
        .await
        .unwrap();
    assert_eq!(response.method, ResolvedMethod::Reconnect);
}

#[tokio::test]
async fn test_owning_process_hears_about_created_rooms() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;
    let mut assignments = harness.matchmaker.process_assignments("p1").await.unwrap();

    let mut options = ClientOptions::new();
    options.insert("mode".to_string(), serde_json::json!("ranked"));
    let response = harness
        .matchmaker
        .invoke(MatchMethod::Create, "arena", options, None)
        .await
        .unwrap();

    let assignment = tokio::time::timeout(Duration::from_secs(1), assignments.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(assignment.room_id, response.room_id);
    assert_eq!(assignment.room_name, "arena");
    assert_eq!(assignment.options["mode"], "ranked");
    assert!(assignment.request_id.is_none());
}

#[tokio::test]
async fn test_queue_create_behavior_routes_create_through_queue() {
    let settings = room_matchmaker::config::MatchmakingSettings {
        create_behavior: CreateBehavior::Queue,
        ..arena_settings(4)
    };
    let harness = TestHarness::with_processes(settings, &["p1"]).await;

    let matchmaker = harness.matchmaker.clone();
    let call = tokio::spawn(async move {
        matchmaker
            .invoke(MatchMethod::Create, "arena", ClientOptions::new(), None)
            .await
    });

    let mut drained = 0;
    while drained == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        drained = harness.scheduler.tick().await.unwrap().drained;
    }
    let response = call.await.unwrap().unwrap();
    assert_eq!(response.method, ResolvedMethod::Create);
}

#[tokio::test]
async fn test_scheduler_rejects_local_registry() {
    let harness = TestHarness::new(arena_settings(4)).await;
    let local = Arc::new(
        Registry::new(harness.store.clone(), &fixtures::test_registry_settings())
            .with_mode(RegistryMode::Local),
    );
    let responses = Arc::new(
        ResponseChannel::new(harness.store.clone(), "other:matches")
            .await
            .unwrap(),
    );

    let err = MatchmakingScheduler::new(
        local,
        harness.queue.clone(),
        responses,
        arena_settings(4),
    )
    .err()
    .expect("local registry must be rejected");
    assert!(matches!(
        error_of(&err),
        MatchmakingError::ConfigurationError { .. }
    ));
}

#[tokio::test]
async fn test_large_tick_answers_every_waiter() {
    let harness = TestHarness::with_processes(arena_settings(2), &["p1", "p2"]).await;

    let mut pending = Vec::new();
    for _ in 0..5000 {
        pending.push(harness.enqueue(MatchMethod::JoinOrCreate, "arena").await);
    }

    let report = harness.scheduler.tick().await.unwrap();
    assert_eq!(report.drained, 5000);
    assert_eq!(report.created, 2500);
    assert_eq!(report.joined, 2500);

    let responses = join_all(pending.into_iter().map(|waiter| waiter.wait())).await;
    let answered = responses.iter().filter(|response| response.is_ok()).count();
    assert_eq!(answered, 5000);
    assert_eq!(harness.responses.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_tick_report_counts_reconnects_apart_from_joins() {
    let harness = TestHarness::with_processes(arena_settings(4), &["p1"]).await;
    harness
        .registry
        .create_room(&room("full", "p1", 4, 4))
        .await
        .unwrap();
    harness
        .registry
        .create_room(&room("open", "p1", 1, 4))
        .await
        .unwrap();

    let reconnect = harness.enqueue(MatchMethod::Reconnect, "full").await;
    let by_id = harness.enqueue(MatchMethod::JoinById, "open").await;
    let join = harness.enqueue(MatchMethod::Join, "arena").await;

    let report = harness.scheduler.tick().await.unwrap();
    assert_eq!(report.reconnected, 1);
    assert_eq!(report.joined, 2);
    assert_eq!(report.created, 0);
    assert_eq!(report.resolved(), 3);

    assert_eq!(reconnect.wait().await.unwrap().method, ResolvedMethod::Reconnect);
    assert_eq!(by_id.wait().await.unwrap().method, ResolvedMethod::JoinById);
    assert_eq!(join.wait().await.unwrap().room_id, "open");
}

#[derive(Debug, Clone)]
enum Op {
    Create { id: usize, clients: u32, locked: bool },
    Save { id: usize, clients: u32, locked: bool },
    Remove { id: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 0..5u32, any::<bool>())
            .prop_map(|(id, clients, locked)| Op::Create { id, clients, locked }),
        (0..4usize, 0..5u32, any::<bool>())
            .prop_map(|(id, clients, locked)| Op::Save { id, clients, locked }),
        (0..4usize).prop_map(|id| Op::Remove { id }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_indexes_follow_every_write(ops in prop::collection::vec(op_strategy(), 1..30)) {
        tokio_test::block_on(async {
            let (_store, registry) = memory_registry();
            registry.register_process(&process("p1", 2567)).await.unwrap();
            let mut model: BTreeMap<String, (u32, bool)> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Create { id, clients, locked } | Op::Save { id, clients, locked } => {
                        let room_id = format!("r{}", id);
                        let mut record = room(&room_id, "p1", clients, 4);
                        record.locked = locked;
                        let is_save = matches!(op, Op::Save { .. });
                        let result = if is_save {
                            registry.save_room(&record).await
                        } else {
                            registry.create_room(&record).await
                        };
                        if is_save && !model.contains_key(&room_id) {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            model.insert(room_id, (clients, locked));
                        }
                    }
                    Op::Remove { id } => {
                        let room_id = format!("r{}", id);
                        let existed = registry.remove_room(&room_id).await.unwrap();
                        prop_assert_eq!(existed, model.remove(&room_id).is_some());
                    }
                }

                let eligible: Vec<String> = registry
                    .eligible_rooms()
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|r| r.room_id)
                    .collect();
                let expected: Vec<String> = model
                    .iter()
                    .filter(|(_, (clients, locked))| !locked && *clients < 4)
                    .map(|(id, _)| id.clone())
                    .collect();
                let mut eligible_sorted = eligible.clone();
                eligible_sorted.sort();
                prop_assert_eq!(eligible_sorted, expected);

                let locked: HashSet<String> = registry
                    .query_rooms(&RoomQuery::new().eq("locked", true))
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|r| r.room_id)
                    .collect();
                let expected_locked: HashSet<String> = model
                    .iter()
                    .filter(|(_, (_, locked))| *locked)
                    .map(|(id, _)| id.clone())
                    .collect();
                prop_assert_eq!(locked, expected_locked);

                let score = registry.find_process("p1").await.unwrap().unwrap().score;
                let expected_score: u32 = model.values().map(|(clients, _)| clients).sum();
                prop_assert_eq!(score, expected_score as f64);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
