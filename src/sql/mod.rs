//! SQL source handling.
//!
//! This module turns SQL text into executable descriptors:
//! - Named parameter rewriting (`:name` to `$N`)
//! - Source discovery from inline text and `*.sql` files
//! - Compiled descriptors and the registry that holds them

pub mod db_call;
pub mod parser;
pub mod registry;
pub mod source;

pub use db_call::{DbCall, RAW_QUERY_NAME};
pub use parser::{ParamMapping, RewriteResult, parse_sql};
pub use registry::QueryRegistry;
pub use source::{SourceUnit, load_sql_files};
