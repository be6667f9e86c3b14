//! tinysql
//!
//! Keep SQL in `.sql` files, call it by name with JSON parameters.
//!
//! Every `*.sql` file under the configured root directories becomes a named
//! query keyed by its relative path (`users/find_by_id.sql` is
//! `users.find_by_id`). `:name` placeholders are rewritten to positional
//! markers once at load time and bound from a JSON object on each call.
//! Calls can be observed through [`hooks::TinyHooks`] and grouped into
//! transactions on a single pooled connection. PostgreSQL and SQLite are
//! supported through sqlx.

pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod models;
pub mod sql;
pub mod tiny;

pub use config::{Config, PoolOptions, TinyOptions};
pub use error::{DbError, DbResult, QueryError};
pub use hooks::TinyHooks;
pub use models::QueryResult;
pub use tiny::TinySql;
