//! Registry records
//!
//! Rooms and processes are fixed structures with a typed metadata side-map.
//! The metadata schema drives indexing and decoding.

pub mod process;
pub mod room;
pub mod schema;

pub use process::ProcessRecord;
pub use room::{RoomRecord, RoomUpdate};
pub use schema::{FieldType, FieldValue, MetadataSchema, SchemaField};
