//! Room and process registry
//!
//! Every room write is a single guarded transaction that stores the body,
//! moves the room's secondary index entries and adjusts its process score.
//! Concurrent writers to the same room conflict on the guard and retry
//! against the fresh snapshot.

pub mod index;
pub mod keys;
pub mod local;
pub mod processes;
pub mod query;
pub mod rooms;

pub use keys::KeyLayout;
pub use local::LocalRooms;
pub use processes::{ProcessFilter, CLEANUP_BATCH_SIZE};
pub use query::{Condition, RoomQuery};
pub use rooms::{Registry, MAX_WRITE_ATTEMPTS};
