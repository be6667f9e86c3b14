//! Query-related data models.
//!
//! This module defines the positional parameter values handed to the driver
//! and the uniform result returned by every call.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A resolved positional parameter, converted from the caller's JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Any JSON integer that fits in i64
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as JSON
    Json(JsonValue),
}

impl QueryParam {
    /// Type name shown in trace logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(*v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => Self::Int(v),
                // u64 beyond i64::MAX and real numbers
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(v) => Self::String(v.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json(value.clone()),
        }
    }
}

/// Result of executing a named or raw query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Number of rows returned by the statement
    pub row_count: usize,
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    /// The statement text that was sent to the driver
    pub command: String,
}

impl QueryResult {
    /// Create a result from decoded rows.
    pub fn new(rows: Vec<serde_json::Map<String, JsonValue>>, command: impl Into<String>) -> Self {
        Self {
            row_count: rows.len(),
            rows,
            command: command.into(),
        }
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Deserialize every row into `T`.
    pub fn rows_as<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        self.rows
            .iter()
            .map(|row| serde_json::from_value(JsonValue::Object(row.clone())))
            .collect()
    }
}
