//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management and connection leases
//! - Parameter resolution and binding
//! - Query execution
//! - Transactions on a pinned connection
//! - Type mappings

pub mod executor;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use executor::QueryExecutor;
pub use params::{lookup, resolve_params};
pub use pool::{ConnectionLease, DbConnection, DbPool, PinnedConnection};
pub use transaction::{Transaction, generate_transaction_id};
