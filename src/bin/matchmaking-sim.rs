//! Matchmaking simulator
//!
//! Drives the full queue → scheduler → response path in one process against
//! the configured registry backend (in-memory by default) and reports how
//! requests were placed.
//!
//! Usage:
//!   cargo run --bin matchmaking-sim -- burst --processes 4 --requests 200 --max-clients 8
//!   cargo run --bin matchmaking-sim -- cleanup --rooms 1200
//!   cargo run --bin matchmaking-sim -- --backend redis --url redis://127.0.0.1/ burst

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use room_matchmaker::config::{
    CreateBehavior, MatchmakingSettings, RegistryBackend, RegistrySettings, RoomDefinition,
};
use room_matchmaker::error::MatchmakingError;
use room_matchmaker::queue::{RequestQueue, ResponseChannel};
use room_matchmaker::record::{ProcessRecord, RoomRecord, RoomUpdate};
use room_matchmaker::registry::Registry;
use room_matchmaker::scheduler::{Matchmaker, MatchmakingScheduler};
use room_matchmaker::store;
use room_matchmaker::types::{ClientOptions, MatchMethod, MatchResponse, ResolvedMethod};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "matchmaking-sim")]
#[command(about = "In-process load simulator for the room matchmaker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Registry backend
    #[arg(long, default_value = "memory")]
    backend: RegistryBackend,

    /// Registry connection URL for redis/postgres
    #[arg(long)]
    url: Option<String>,

    /// Key prefix isolating this run
    #[arg(long, default_value = "simcaches")]
    prefix: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Fire concurrent joinOrCreate calls at one room name
    Burst {
        /// Worker processes to register
        #[arg(short, long, default_value = "4")]
        processes: usize,
        /// Concurrent requests
        #[arg(short, long, default_value = "100")]
        requests: usize,
        /// Room name to match on
        #[arg(long, default_value = "arena")]
        room: String,
        /// Capacity of created rooms
        #[arg(short, long, default_value = "8")]
        max_clients: u32,
        /// Scheduler tick interval in milliseconds
        #[arg(long, default_value = "50")]
        tick_ms: u64,
    },
    /// Create rooms for one process, then remove them all through cleanup
    Cleanup {
        /// Rooms owned by the process
        #[arg(short, long, default_value = "1200")]
        rooms: usize,
    },
}

fn registry_settings(cli: &Cli) -> RegistrySettings {
    RegistrySettings {
        backend: cli.backend,
        url: cli.url.clone(),
        key_prefix: cli.prefix.clone(),
        queue_key: format!("{}:requests", cli.prefix),
        response_topic_prefix: format!("{}:matches", cli.prefix),
        ..Default::default()
    }
}

/// Act as the owning process: persist what the matchmaker assigned
async fn persist(registry: &Registry, response: &MatchResponse, max_clients: u32) -> Result<()> {
    match response.method {
        ResolvedMethod::Create => {
            let room = RoomRecord::new(response.room_name.clone(), response.process_id.clone())
                .with_room_id(response.room_id.clone())
                .with_clients(1)
                .with_max_clients(max_clients);
            registry.create_room(&room).await
        }
        ResolvedMethod::Join | ResolvedMethod::JoinById => {
            let update = RoomUpdate::new().inc("clients", 1.0);
            // the creating caller of a same-tick room may not have persisted it yet
            for _ in 0..20 {
                match registry.update_room(&response.room_id, &update).await {
                    Ok(_) => return Ok(()),
                    Err(e)
                        if matches!(
                            e.downcast_ref::<MatchmakingError>(),
                            Some(MatchmakingError::NotFound { .. })
                        ) =>
                    {
                        tokio::time::sleep(Duration::from_millis(10)).await
                    }
                    Err(e) => return Err(e),
                }
            }
            warn!("Room {} never appeared in the registry", response.room_id);
            Ok(())
        }
        ResolvedMethod::Reconnect => Ok(()),
    }
}

async fn run_burst(
    settings: RegistrySettings,
    processes: usize,
    requests: usize,
    room: String,
    max_clients: u32,
    tick_ms: u64,
) -> Result<()> {
    let store = store::connect(&settings).await?;
    let registry = Arc::new(Registry::new(store.clone(), &settings));

    for i in 0..processes {
        let process =
            ProcessRecord::new(format!("sim-{}", i), format!("127.0.0.1:{}", 2567 + i));
        registry.register_process(&process).await?;
    }

    let queue = Arc::new(RequestQueue::new(store.clone(), settings.queue_key.clone()));
    let responses = Arc::new(
        ResponseChannel::new(store.clone(), settings.response_topic_prefix.clone()).await?,
    );
    let matchmaking = MatchmakingSettings {
        tick_interval_ms: tick_ms,
        create_behavior: CreateBehavior::Queue,
        rooms: vec![RoomDefinition::new(room.clone()).with_max_clients(max_clients)],
        ..Default::default()
    };

    let scheduler = Arc::new(MatchmakingScheduler::new(
        registry.clone(),
        queue.clone(),
        responses.clone(),
        matchmaking.clone(),
    )?);
    let matchmaker = Arc::new(Matchmaker::new(
        registry.clone(),
        queue,
        responses,
        matchmaking,
    )?);

    let (shutdown_tx, _) = broadcast::channel(1);
    let ticker = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let started = Instant::now();
    let mut calls = JoinSet::new();
    for _ in 0..requests {
        let matchmaker = matchmaker.clone();
        let registry = registry.clone();
        let room = room.clone();
        calls.spawn(async move {
            let response = matchmaker
                .invoke(MatchMethod::JoinOrCreate, &room, ClientOptions::new(), None)
                .await?;
            persist(&registry, &response, max_clients).await?;
            Ok::<_, anyhow::Error>(response)
        });
    }

    let mut placements: BTreeMap<String, (String, u32)> = BTreeMap::new();
    let (mut created, mut joined, mut failed) = (0, 0, 0);
    while let Some(result) = calls.join_next().await {
        match result? {
            Ok(response) => {
                match response.method {
                    ResolvedMethod::Create => created += 1,
                    _ => joined += 1,
                }
                placements
                    .entry(response.room_id.clone())
                    .or_insert_with(|| (response.process_id.clone(), 0))
                    .1 += 1;
            }
            Err(e) => {
                failed += 1;
                warn!("Request failed: {}", e);
            }
        }
    }

    let _ = shutdown_tx.send(());
    ticker.await?;

    println!("Burst finished in {:?}", started.elapsed());
    println!("  created: {}, joined: {}, failed: {}", created, joined, failed);
    for (room_id, (process_id, clients)) in &placements {
        println!("  {} on {}: {} clients", room_id, process_id, clients);
    }
    for process in registry.query_processes(&Default::default()).await? {
        println!("  {} score {}", process.process_id, process.score);
    }
    Ok(())
}

async fn run_cleanup(settings: RegistrySettings, rooms: usize) -> Result<()> {
    let store = store::connect(&settings).await?;
    let registry = Registry::new(store, &settings);

    let process = ProcessRecord::new("sim-doomed", "127.0.0.1:2567");
    registry.register_process(&process).await?;

    let started = Instant::now();
    for i in 0..rooms {
        let room = RoomRecord::new("arena", "sim-doomed")
            .with_room_id(format!("doomed-{}", i))
            .with_clients((i % 4) as u32)
            .with_max_clients(4);
        registry.create_room(&room).await?;
    }
    info!("Created {} rooms in {:?}", rooms, started.elapsed());

    let started = Instant::now();
    let removed = registry.cleanup_process("sim-doomed").await?;
    println!("Cleanup removed {} rooms in {:?}", removed, started.elapsed());
    println!(
        "  process still registered: {}",
        registry.find_process("sim-doomed").await?.is_some()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let settings = registry_settings(&cli);

    match cli.command {
        Commands::Burst {
            processes,
            requests,
            room,
            max_clients,
            tick_ms,
        } => run_burst(settings, processes, requests, room, max_clients, tick_ms).await,
        Commands::Cleanup { rooms } => run_cleanup(settings, rooms).await,
    }
}
