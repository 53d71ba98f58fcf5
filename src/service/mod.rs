//! Service layer for the matchmaking scheduler
//!
//! Application state, background task management and health checks.

pub mod app;
pub mod health;

pub use app::{AppState, ServiceError};
pub use health::{HealthCheck, HealthStatus};
