//! Per-call identifiers and the phase records handed to hooks.
//!
//! A call moves through begin, submit and complete. Each phase record is a
//! superset of the previous one so observers can correlate them by `id`.

use crate::models::QueryResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::backtrace::Backtrace;
use std::panic::Location;
use std::sync::Arc;

/// Identifiers for one `sql` or `query` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    pub query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl CallContext {
    /// Create a context with a fresh query id.
    pub fn new(transaction_id: Option<String>) -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            transaction_id,
        }
    }
}

/// Where a `sql` or `query` call was made, captured when stack capture is on.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

impl CallSite {
    /// Capture the location of the caller and the current backtrace.
    #[track_caller]
    pub fn capture() -> Self {
        Self {
            location: Location::caller(),
            backtrace: Arc::new(Backtrace::force_capture()),
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.location, self.backtrace)
    }
}

/// Emitted once a connection has been acquired for the call.
#[derive(Debug, Clone, Serialize)]
pub struct QueryBeginContext {
    pub id: String,
    pub name: String,
    /// Parameterized SQL
    pub sql: String,
    pub start: DateTime<Utc>,
    pub params: JsonValue,
}

/// Emitted right before the statement is handed to the driver.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySubmitContext {
    #[serde(flatten)]
    pub begin: QueryBeginContext,
    pub submit: DateTime<Utc>,
    /// Time from call start to submission
    pub wait_duration_ms: u64,
}

/// Emitted exactly once per call, on success and on failure.
#[derive(Debug, Clone, Serialize)]
pub struct QueryCompleteContext {
    #[serde(flatten)]
    pub begin: QueryBeginContext,
    /// None when the call failed before reaching the driver
    pub submit: Option<DateTime<Utc>>,
    pub wait_duration_ms: u64,
    /// Time from submission to completion
    pub active_duration_ms: u64,
    pub end: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryResult>,
}

impl QueryCompleteContext {
    /// Whether the call failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
