//! Utility functions for the matchmaking core

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{MatchmakingError, Result};
use crate::types::ConnectionSettings;

/// Length of generated request and room ids
pub const SHORT_ID_LENGTH: usize = 9;

/// Generate a new unique request ID
pub fn generate_request_id() -> String {
    short_id()
}

/// Generate a new unique room ID
pub fn generate_room_id() -> String {
    short_id()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..SHORT_ID_LENGTH].to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Split a `host:port[:path]` (or `host:port/path`) public address into
/// connection settings
pub fn parse_public_address(address: &str, secure: bool) -> Result<ConnectionSettings> {
    if address.is_empty() {
        return Err(MatchmakingError::ConfigurationError {
            message: "public address cannot be empty".to_string(),
        }
        .into());
    }

    let (host_port, path) = match address.find('/') {
        Some(idx) => (&address[..idx], &address[idx..]),
        None => (address, ""),
    };

    let mut parts = host_port.splitn(3, ':');
    let hostname = parts.next().unwrap_or_default().to_string();
    let port = match parts.next() {
        Some(port) if !port.is_empty() => Some(port.parse::<u16>().map_err(|_| {
            MatchmakingError::ConfigurationError {
                message: format!("invalid port in public address '{}'", address),
            }
        })?),
        _ => None,
    };

    let pathname = match parts.next() {
        Some(rest) => format!("/{}{}", rest.trim_start_matches('/'), path),
        None => path.to_string(),
    };

    if hostname.is_empty() {
        return Err(MatchmakingError::ConfigurationError {
            message: format!("missing hostname in public address '{}'", address),
        }
        .into());
    }

    Ok(ConnectionSettings {
        hostname,
        secure,
        pathname,
        port,
    })
}
