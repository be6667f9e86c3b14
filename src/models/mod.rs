//! Data models for tinysql.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod context;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, is_in_memory_sqlite, masked_connection_string};
pub use context::{
    CallContext, CallSite, QueryBeginContext, QueryCompleteContext, QuerySubmitContext,
};
pub use query::{QueryParam, QueryResult};
