//! Registry backend configuration

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{MatchmakingError, Result};
use crate::record::{MetadataSchema, SchemaField};

/// Storage backend holding the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Redis,
    Postgres,
}

impl FromStr for RegistryBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RegistryBackend::Memory),
            "redis" | "valkey" => Ok(RegistryBackend::Redis),
            "postgres" | "postgresql" => Ok(RegistryBackend::Postgres),
            other => Err(anyhow::anyhow!("Invalid registry backend: {}", other)),
        }
    }
}

impl std::fmt::Display for RegistryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryBackend::Memory => write!(f, "memory"),
            RegistryBackend::Redis => write!(f, "redis"),
            RegistryBackend::Postgres => write!(f, "postgres"),
        }
    }
}

/// Whether queries see the shared store or only rooms created locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Queries go to the shared store; a scheduler may run
    Shared,
    /// No external scheduler: queries only see this instance's rooms
    Local,
}

impl FromStr for RegistryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(RegistryMode::Shared),
            "local" => Ok(RegistryMode::Local),
            other => Err(anyhow::anyhow!("Invalid registry mode: {}", other)),
        }
    }
}

/// Registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub backend: RegistryBackend,
    /// Connection URL, required for redis and postgres
    pub url: Option<String>,
    /// Prefix for every registry key (or table name)
    pub key_prefix: String,
    /// Key of the pending request queue
    pub queue_key: String,
    /// Per-request response topics are `<prefix>:<requestId>`
    pub response_topic_prefix: String,
    pub mode: RegistryMode,
    /// Custom metadata fields appended to the built-in room fields
    pub metadata_schema: Vec<SchemaField>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            url: None,
            key_prefix: "roomcaches".to_string(),
            queue_key: "matchmaking:requests".to_string(),
            response_topic_prefix: "matchmaking:matches".to_string(),
            mode: RegistryMode::Shared,
            metadata_schema: Vec::new(),
        }
    }
}

impl RegistrySettings {
    pub fn require_url(&self) -> Result<&str> {
        self.url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                MatchmakingError::ConfigurationError {
                    message: format!("registry backend {:?} requires a url", self.backend),
                }
                .into()
            })
    }

    /// Built-in room fields plus the configured metadata fields
    pub fn schema(&self) -> MetadataSchema {
        MetadataSchema::with_metadata(self.metadata_schema.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldType;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("valkey".parse::<RegistryBackend>().unwrap(), RegistryBackend::Redis);
        assert_eq!("Postgres".parse::<RegistryBackend>().unwrap(), RegistryBackend::Postgres);
        assert!("mongo".parse::<RegistryBackend>().is_err());
    }

    #[test]
    fn test_require_url() {
        let mut settings = RegistrySettings {
            backend: RegistryBackend::Redis,
            ..Default::default()
        };
        assert!(settings.require_url().is_err());
        settings.url = Some("redis://localhost".to_string());
        assert_eq!(settings.require_url().unwrap(), "redis://localhost");
    }

    #[test]
    fn test_schema_includes_custom_fields() {
        let settings = RegistrySettings {
            metadata_schema: vec![SchemaField {
                field: "region".to_string(),
                field_type: FieldType::String,
            }],
            ..Default::default()
        };
        let schema = settings.schema();
        assert_eq!(schema.field_type("region"), Some(FieldType::String));
        assert_eq!(schema.field_type("clients"), Some(FieldType::Number));
    }
}
