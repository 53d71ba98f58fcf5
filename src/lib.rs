//! Room Matchmaker - distributed matchmaking core for multiplayer game rooms
//!
//! Keeps a consistent, indexed registry of rooms and worker processes in a
//! shared store and resolves join/create requests to concrete rooms through
//! a batch scheduler or direct dispatch.

pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use policy::MatchmakingPolicy;
pub use queue::{RequestQueue, ResponseChannel};
pub use record::{MetadataSchema, ProcessRecord, RoomRecord, RoomUpdate};
pub use registry::{Registry, RoomQuery};
pub use scheduler::{Matchmaker, MatchmakingScheduler};
pub use store::{MemoryStore, StoreBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
