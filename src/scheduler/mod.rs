//! Matchmaking scheduler
//!
//! A tick drains the request queue, loads a snapshot of eligible rooms and
//! candidate processes, resolves every request in enqueue order against that
//! snapshot and publishes one outcome per request. Durable room writes stay
//! with the owning processes.

pub mod matchmaker;
pub mod resolve;
pub mod routing;
pub mod snapshot;
pub mod tick;

pub use matchmaker::{AssignmentStream, Matchmaker};
pub use resolve::{Resolution, Resolver};
pub use routing::{MethodRouting, Route};
pub use snapshot::TickSnapshot;
pub use tick::{MatchmakingScheduler, TickReport};
