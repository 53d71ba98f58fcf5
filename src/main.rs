//! Main entry point for the room matchmaker scheduler service
//!
//! Initializes logging and configuration, runs the matchmaking scheduler
//! with its health endpoints, and shuts down gracefully on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use room_matchmaker::config::{validate_config, AppConfig, RegistryBackend};
use room_matchmaker::service::{AppState, HealthCheck, HealthStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Room Matchmaker - batch matchmaking scheduler for game room fleets
#[derive(Parser)]
#[command(
    name = "room-matchmaker",
    version,
    about = "Batch matchmaking scheduler for multiplayer game rooms",
    long_about = "Room Matchmaker drains queued join/create requests, resolves them against \
                 an indexed registry of rooms and worker processes held in a shared store \
                 (memory, Redis/Valkey or PostgreSQL), and publishes one response per request."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Registry backend override
    #[arg(long, value_name = "BACKEND", help = "Registry backend (memory, redis, postgres)")]
    backend: Option<RegistryBackend>,

    /// Registry URL override
    #[arg(long, value_name = "URL", help = "Override registry connection URL")]
    registry_url: Option<String>,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health/metrics server port")]
    health_port: Option<u16>,

    /// Tick interval override
    #[arg(long, value_name = "MS", help = "Override scheduler tick interval in milliseconds")]
    tick_interval_ms: Option<u64>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Perform health check and return appropriate exit code
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    // no background tasks are started, so only the backend check decides
    let app_state = Arc::new(AppState::new(config).await?);

    match HealthCheck::check(app_state).await {
        Ok(health) => {
            let backend_status = health
                .checks
                .iter()
                .find(|check| check.name == "registry_backend")
                .map(|check| check.status)
                .unwrap_or(HealthStatus::Unhealthy);

            println!("Health Check: {}", backend_status);
            println!("  Backend: {}", health.stats.backend);
            println!("  Eligible Rooms: {}", health.stats.eligible_rooms);
            println!("  Processes: {}", health.stats.processes);
            println!("  Pending Responses: {}", health.stats.pending_responses);

            if backend_status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary periodically
async fn health_check_task(app_state: Arc<AppState>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while app_state.is_running().await {
        interval.tick().await;

        match HealthCheck::check(app_state.clone()).await {
            Ok(health) => {
                info!(
                    "Health check: {} - {} eligible rooms, {} processes, {} pending responses",
                    health.status,
                    health.stats.eligible_rooms,
                    health.stats.processes,
                    health.stats.pending_responses
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("🚀 Room Matchmaker");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    info!("   Registry: {} (prefix '{}')", config.registry.backend, config.registry.key_prefix);
    info!("   Tick interval: {}ms", config.matchmaking.tick_interval_ms);
    info!("   Create behavior: {:?}", config.matchmaking.create_behavior);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(backend) = args.backend {
        config.registry.backend = backend;
    }

    if let Some(url) = &args.registry_url {
        config.registry.url = Some(url.clone());
    }

    if let Some(port) = args.health_port {
        config.service.health_port = port;
    }

    if let Some(interval) = args.tick_interval_ms {
        config.matchmaking.tick_interval_ms = interval;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let app_state = match AppState::new(config.clone()).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            health_check_task(app_state).await;
        })
    };

    info!("✅ Room Matchmaker is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("✅ Graceful shutdown completed successfully"),
        Ok(Err(e)) => error!("Shutdown failed: {}", e),
        Err(_) => warn!("⚠️  Shutdown timeout exceeded, forcing exit"),
    }

    info!("🛑 Room Matchmaker stopped");
    Ok(())
}
