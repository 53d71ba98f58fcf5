//! Configuration management for the room-matchmaker service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values.

pub mod app;
pub mod matchmaking;
pub mod registry;

// Re-export commonly used types
pub use app::{validate_config, AppConfig, ServiceSettings};
pub use matchmaking::{CreateBehavior, MatchmakingSettings, RoomDefinition};
pub use registry::{RegistryBackend, RegistryMode, RegistrySettings};
