//! Common types used throughout the matchmaking core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::{ErrorKind, MatchmakingError};

/// Unique identifier for rooms
pub type RoomId = String;

/// Unique identifier for worker processes
pub type ProcessId = String;

/// Unique identifier for queued match requests
pub type RequestId = String;

/// Options sent by the client along with a matchmaking call
pub type ClientOptions = Map<String, Value>;

/// Matchmaking method requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchMethod {
    Create,
    Join,
    JoinOrCreate,
    JoinById,
    Reconnect,
}

impl MatchMethod {
    pub const ALL: [MatchMethod; 5] = [
        MatchMethod::Create,
        MatchMethod::Join,
        MatchMethod::JoinOrCreate,
        MatchMethod::JoinById,
        MatchMethod::Reconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Create => "create",
            MatchMethod::Join => "join",
            MatchMethod::JoinOrCreate => "joinOrCreate",
            MatchMethod::JoinById => "joinById",
            MatchMethod::Reconnect => "reconnect",
        }
    }
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMethod {
    type Err = MatchmakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| MatchmakingError::UnsupportedOperation {
                message: format!("unknown matchmaking method '{}'", s),
            })
    }
}

/// Method carried by a response payload
///
/// `joinOrCreate` has no counterpart here: a payload always names the
/// branch that was actually taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolvedMethod {
    Create,
    Join,
    JoinById,
    Reconnect,
}

impl ResolvedMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedMethod::Create => "create",
            ResolvedMethod::Join => "join",
            ResolvedMethod::JoinById => "joinById",
            ResolvedMethod::Reconnect => "reconnect",
        }
    }
}

impl std::fmt::Display for ResolvedMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued matchmaking request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub request_id: RequestId,
    pub method: MatchMethod,
    pub room_name_or_id: String,
    #[serde(default)]
    pub client_options: ClientOptions,
    #[serde(default)]
    pub auth_options: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl MatchRequest {
    pub fn new(
        method: MatchMethod,
        room_name_or_id: impl Into<String>,
        client_options: ClientOptions,
        auth_options: Option<Value>,
    ) -> Self {
        Self {
            request_id: crate::utils::generate_request_id(),
            method,
            room_name_or_id: room_name_or_id.into(),
            client_options,
            auth_options,
            enqueued_at: crate::utils::current_timestamp(),
        }
    }
}

/// Where a client must connect to reach its assigned process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub hostname: String,
    pub secure: bool,
    pub pathname: String,
    pub port: Option<u16>,
}

/// Successful resolution of a matchmaking request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    pub method: ResolvedMethod,
    pub room_name: String,
    pub room_id: RoomId,
    pub process_id: ProcessId,
    pub options: ClientOptions,
    pub settings: ConnectionSettings,
}

/// Outcome published on a request's response topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MatchOutcome {
    Success(MatchResponse),
    Failure { kind: ErrorKind, message: String },
}

impl MatchOutcome {
    pub fn failure(error: &anyhow::Error) -> Self {
        let (kind, message) = MatchmakingError::classify(error);
        MatchOutcome::Failure { kind, message }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, MatchOutcome::Success(_))
    }

    /// Convert into the caller-facing result
    pub fn into_result(self) -> crate::error::Result<MatchResponse> {
        match self {
            MatchOutcome::Success(response) => Ok(response),
            MatchOutcome::Failure { kind, message } => {
                Err(MatchmakingError::from_kind(kind, message).into())
            }
        }
    }
}

/// Notice sent to an owning process when a room is assigned to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAssignment {
    pub request_id: Option<RequestId>,
    pub room_id: RoomId,
    pub room_name: String,
    pub options: ClientOptions,
    pub assigned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_method_parsing() {
        assert_eq!(
            "joinOrCreate".parse::<MatchMethod>().unwrap(),
            MatchMethod::JoinOrCreate
        );
        assert_eq!("joinById".parse::<MatchMethod>().unwrap(), MatchMethod::JoinById);
        assert!("spectate".parse::<MatchMethod>().is_err());
    }

    #[test]
    fn test_match_request_serializes_camel_case() {
        let request = MatchRequest::new(MatchMethod::JoinOrCreate, "arena", Map::new(), None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["method"], "joinOrCreate");
        assert_eq!(json["roomNameOrId"], "arena");
        assert!(json.get("requestId").is_some());
    }

    #[test]
    fn test_outcome_tagging() {
        let outcome = MatchOutcome::Failure {
            kind: ErrorKind::NotFound,
            message: "no room".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "not_found");

        let back: MatchOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn test_failure_outcome_into_result() {
        let outcome = MatchOutcome::Failure {
            kind: ErrorKind::NotFound,
            message: "no room".to_string(),
        };
        let err = outcome.into_result().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NotFound { .. })
        ));
    }
}
