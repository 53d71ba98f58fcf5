//! Worker process records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MatchmakingError, Result};
use crate::record::schema::FieldValue;
use crate::types::{ConnectionSettings, ProcessId};
use crate::utils::{current_timestamp, parse_public_address};

/// A registered worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    /// `host:port[:path]`
    pub public_address: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
    /// Aggregate load, lower is preferred. Read from the score index.
    #[serde(skip)]
    pub score: f64,
}

impl ProcessRecord {
    pub fn new(process_id: impl Into<ProcessId>, public_address: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            public_address: public_address.into(),
            secure: false,
            locked: false,
            metadata: BTreeMap::new(),
            created_at: current_timestamp(),
            score: 0.0,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_metadata(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    /// Ensure the process carries the identity needed for routing
    pub fn validate(&self) -> Result<()> {
        if self.process_id.trim().is_empty() {
            return Err(MatchmakingError::ConfigurationError {
                message: "process registration requires a processId".to_string(),
            }
            .into());
        }
        if self.public_address.trim().is_empty() {
            return Err(MatchmakingError::ConfigurationError {
                message: format!(
                    "process {} registration requires a publicAddress",
                    self.process_id
                ),
            }
            .into());
        }
        parse_public_address(&self.public_address, self.secure)?;
        Ok(())
    }

    /// Routing information clients use to reach this process
    pub fn connection_settings(&self) -> Result<ConnectionSettings> {
        parse_public_address(&self.public_address, self.secure)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            MatchmakingError::Serialization {
                message: format!("failed to encode process {}: {}", self.process_id, e),
            }
            .into()
        })
    }

    pub fn decode(body: &str, score: f64) -> Result<Self> {
        let mut process: ProcessRecord = serde_json::from_str(body).map_err(|e| {
            MatchmakingError::Serialization {
                message: format!("failed to decode process body: {}", e),
            }
        })?;
        process.score = score;
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_identity() {
        assert!(ProcessRecord::new("p1", "10.0.0.1:2567").validate().is_ok());

        let err = ProcessRecord::new("", "10.0.0.1:2567").validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::ConfigurationError { .. })
        ));

        let err = ProcessRecord::new("p1", " ").validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_connection_settings() {
        let process = ProcessRecord::new("p1", "game.example.com:443:eu").with_secure(true);
        let settings = process.connection_settings().unwrap();
        assert_eq!(settings.hostname, "game.example.com");
        assert_eq!(settings.port, Some(443));
        assert_eq!(settings.pathname, "/eu");
        assert!(settings.secure);
    }

    #[test]
    fn test_score_not_stored_in_body() {
        let mut process = ProcessRecord::new("p1", "localhost:2567");
        process.score = 12.0;
        let body = process.encode().unwrap();
        assert!(!body.contains("score"));
        assert_eq!(ProcessRecord::decode(&body, 3.0).unwrap().score, 3.0);
    }
}
