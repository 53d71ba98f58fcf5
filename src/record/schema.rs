//! Metadata schema and typed field values
//!
//! The schema is an ordered field → type mapping. It decides which record
//! fields get secondary indexes and how values are coerced when a stored
//! body is read back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MatchmakingError, Result};

/// Type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    /// Stored verbatim, never indexed
    Json,
}

impl FieldType {
    pub fn is_indexed(&self) -> bool {
        !matches!(self, FieldType::Json)
    }
}

/// A typed record field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Json(Value),
}

impl FieldValue {
    /// Convert a raw JSON value without schema guidance
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => FieldValue::Boolean(b),
            Value::Number(n) => match n.as_f64() {
                Some(f) => FieldValue::Number(f),
                None => FieldValue::Json(Value::Number(n)),
            },
            Value::String(s) => FieldValue::String(s),
            other => FieldValue::Json(other),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Token used in membership-set key names, `None` for json values
    pub fn index_token(&self) -> Option<String> {
        match self {
            FieldValue::Boolean(b) => Some(b.to_string()),
            FieldValue::Number(n) => Some(format_number(*n)),
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Json(_) => None,
        }
    }

    /// Loose equality against a client-supplied JSON value
    pub fn matches_json(&self, other: &Value) -> bool {
        match (self, other) {
            (FieldValue::Boolean(a), Value::Bool(b)) => a == b,
            (FieldValue::Number(a), Value::Number(b)) => b.as_f64() == Some(*a),
            (FieldValue::String(a), Value::String(b)) => a == b,
            (FieldValue::Json(a), b) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// Canonical text form of a number: integral values carry no fraction
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One schema entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Ordered mapping of field name to type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSchema {
    fields: Vec<SchemaField>,
}

/// Field that is never indexed: equality on it is a point lookup
pub const ROOM_ID_FIELD: &str = "roomId";

/// Derived field maintained from the eligibility predicate
pub const ELIGIBLE_FIELD: &str = "eligibleForMatchmaking";

impl MetadataSchema {
    /// Empty schema
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// Built-in room fields, in index order
    pub fn room_defaults() -> Self {
        Self::empty()
            .with_field("clients", FieldType::Number)
            .with_field("locked", FieldType::Boolean)
            .with_field("private", FieldType::Boolean)
            .with_field("maxClients", FieldType::Number)
            .with_field("name", FieldType::String)
            .with_field("processId", FieldType::String)
            .with_field(ROOM_ID_FIELD, FieldType::String)
            .with_field(ELIGIBLE_FIELD, FieldType::Boolean)
            .with_field("createdAt", FieldType::Number)
            .with_field("unlisted", FieldType::Boolean)
    }

    /// Built-in room fields extended with custom metadata fields
    ///
    /// A custom entry with the same name as a built-in one replaces its type
    /// but keeps its position.
    pub fn with_metadata(custom: impl IntoIterator<Item = SchemaField>) -> Self {
        let mut schema = Self::room_defaults();
        for entry in custom {
            schema = schema.with_field(entry.field, entry.field_type);
        }
        schema
    }

    pub fn with_field(mut self, field: impl Into<String>, field_type: FieldType) -> Self {
        let field = field.into();
        match self.fields.iter_mut().find(|f| f.field == field) {
            Some(existing) => existing.field_type = field_type,
            None => self.fields.push(SchemaField { field, field_type }),
        }
        self
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.field_type)
    }

    pub fn fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.iter()
    }

    /// Fields that receive secondary index entries
    pub fn indexed_fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields
            .iter()
            .filter(|f| f.field_type.is_indexed() && f.field != ROOM_ID_FIELD)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Coerce a raw stored value into the declared type of `field`
    ///
    /// Undeclared fields are converted loosely.
    pub fn coerce(&self, field: &str, raw: Value) -> Result<FieldValue> {
        let Some(field_type) = self.field_type(field) else {
            return Ok(FieldValue::from_json(raw));
        };

        let mismatch = |raw: &Value| -> anyhow::Error {
            MatchmakingError::Serialization {
                message: format!("field '{}' expected {:?}, got {}", field, field_type, raw),
            }
            .into()
        };

        match field_type {
            FieldType::Json => Ok(FieldValue::Json(raw)),
            FieldType::Boolean => match &raw {
                Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
                Value::String(s) if s == "true" => Ok(FieldValue::Boolean(true)),
                Value::String(s) if s == "false" => Ok(FieldValue::Boolean(false)),
                _ => Err(mismatch(&raw)),
            },
            FieldType::Number => match &raw {
                Value::Number(n) => n.as_f64().map(FieldValue::Number).ok_or_else(|| mismatch(&raw)),
                Value::String(s) => s
                    .parse::<f64>()
                    .map(FieldValue::Number)
                    .map_err(|_| mismatch(&raw)),
                _ => Err(mismatch(&raw)),
            },
            FieldType::String => match raw {
                Value::String(s) => Ok(FieldValue::String(s)),
                Value::Number(n) => Ok(FieldValue::String(n.to_string())),
                Value::Bool(b) => Ok(FieldValue::String(b.to_string())),
                other => Err(mismatch(&other)),
            },
        }
    }
}

impl Default for MetadataSchema {
    fn default() -> Self {
        Self::room_defaults()
    }
}
