//! Request queue and response channel

pub mod requests;
pub mod responses;

pub use requests::RequestQueue;
pub use responses::{PendingResponse, ResponseChannel, RESPONSE_TIMEOUT};
