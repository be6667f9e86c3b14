//! Query execution engine.
//!
//! This module runs one compiled [`DbCall`] end to end:
//! - Named parameter resolution against the caller's JSON
//! - Connection acquisition (pinned or pooled) and release
//! - Hook notifications for each phase
//! - Contextualized errors passed through the error transformer
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `postgres`: PostgreSQL-specific fetch
//! - `sqlite`: SQLite-specific fetch
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::db::params::resolve_params;
use crate::db::pool::{ConnectionLease, DbConnection, DbPool, PinnedConnection};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult, ErrorTransformer, QueryError};
use crate::hooks::HookLifecycle;
use crate::models::{
    CallContext, CallSite, QueryBeginContext, QueryCompleteContext, QueryParam, QueryResult,
    QuerySubmitContext,
};
use crate::sql::DbCall;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Executes calls for one handle.
pub struct QueryExecutor<'a> {
    pool: &'a DbPool,
    pinned: Option<&'a PinnedConnection>,
    error_transformer: &'a ErrorTransformer,
    call_site: Option<&'a CallSite>,
}

/// When the statement was handed to the driver, and how long that took.
struct Submitted {
    at: DateTime<Utc>,
    after: Duration,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(
        pool: &'a DbPool,
        pinned: Option<&'a PinnedConnection>,
        error_transformer: &'a ErrorTransformer,
    ) -> Self {
        Self {
            pool,
            pinned,
            error_transformer,
            call_site: None,
        }
    }

    /// Append this call site to error diagnostics.
    pub fn with_call_site(mut self, call_site: Option<&'a CallSite>) -> Self {
        self.call_site = call_site;
        self
    }

    /// Run `db_call` with `params`, notifying `hooks` along the way.
    ///
    /// `on_result` fires exactly once, on success and on failure.
    pub async fn perform_db_call(
        &self,
        db_call: &DbCall,
        hooks: &mut HookLifecycle,
        params: JsonValue,
        call: &CallContext,
    ) -> DbResult<QueryResult> {
        let started = Instant::now();
        let begin = QueryBeginContext {
            id: call.query_id.clone(),
            name: db_call.name.clone(),
            sql: db_call.parameterized_sql.clone(),
            start: Utc::now(),
            params,
        };

        debug!(
            query_id = %call.query_id,
            transaction_id = ?call.transaction_id,
            name = %db_call.name,
            params = db_call.mapping.len(),
            "Executing query"
        );

        let mut submitted = None;
        let outcome = self
            .execute(db_call, hooks, &begin, started, &mut submitted)
            .await;

        let elapsed = started.elapsed();
        let (submit, wait, active) = match submitted {
            Some(Submitted { at, after }) => (Some(at), after, elapsed.saturating_sub(after)),
            None => (None, elapsed, Duration::ZERO),
        };
        let mut complete = QueryCompleteContext {
            begin,
            submit,
            wait_duration_ms: wait.as_millis() as u64,
            active_duration_ms: active.as_millis() as u64,
            end: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            error: None,
            data: None,
        };

        match outcome {
            Ok(data) => {
                debug!(
                    query_id = %call.query_id,
                    rows = data.row_count,
                    duration_ms = complete.duration_ms,
                    "Query completed"
                );
                if !hooks.is_empty() {
                    complete.data = Some(data.clone());
                    hooks.on_result(&complete);
                }
                Ok(data)
            }
            Err(cause) => {
                debug!(query_id = %call.query_id, error = %cause, "Query failed");
                let message = cause.to_string();
                let mut diagnostic = format!(
                    "[{}]\n\n{}\n\nstarted={} wait={}ms active={}ms total={}ms\n\n{}",
                    db_call.name,
                    db_call.text,
                    complete.begin.start.to_rfc3339(),
                    complete.wait_duration_ms,
                    complete.active_duration_ms,
                    complete.duration_ms,
                    cause
                );
                if let Some(site) = self.call_site {
                    diagnostic.push_str(&format!("\n\nFrom: {}", site));
                }
                complete.error = Some(message.clone());
                hooks.on_result(&complete);

                let err = DbError::Query(Box::new(QueryError {
                    message,
                    diagnostic,
                    context: complete,
                    cause,
                }));
                Err((self.error_transformer)(err))
            }
        }
    }

    async fn execute(
        &self,
        db_call: &DbCall,
        hooks: &mut HookLifecycle,
        begin: &QueryBeginContext,
        started: Instant,
        submitted: &mut Option<Submitted>,
    ) -> DbResult<QueryResult> {
        let values = resolve_params(db_call, &begin.params)?;
        trace!(
            query_id = %begin.id,
            param_types = ?values.iter().map(QueryParam::type_name).collect::<Vec<_>>(),
            "Resolved parameters"
        );

        let mut lease = ConnectionLease::acquire(self.pool, self.pinned).await?;
        hooks.on_query(begin);

        let at = Utc::now();
        let after = started.elapsed();
        if !hooks.is_empty() {
            hooks.on_submit(&QuerySubmitContext {
                begin: begin.clone(),
                submit: at,
                wait_duration_ms: after.as_millis() as u64,
            });
        }
        *submitted = Some(Submitted { at, after });

        if let Some(prepared_name) = &db_call.prepared_name {
            debug!(prepared_name = %prepared_name, "Using prepared statement");
        }
        let rows = fetch_rows(
            &mut lease,
            &db_call.parameterized_sql,
            &values,
            db_call.prepared,
        )
        .await;
        lease.release();

        Ok(QueryResult::new(rows?, db_call.parameterized_sql.clone()))
    }
}

/// Run a statement on `conn` and decode every row.
pub async fn fetch_rows(
    conn: &mut DbConnection,
    sql: &str,
    params: &[QueryParam],
    persistent: bool,
) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
    match conn {
        DbConnection::Postgres(c) => {
            let rows = postgres::fetch_rows(c, sql, params, persistent).await?;
            Ok(rows.iter().map(RowToJson::to_json_map).collect())
        }
        DbConnection::SQLite(c) => {
            let rows = sqlite::fetch_rows(c, sql, params, persistent).await?;
            Ok(rows.iter().map(RowToJson::to_json_map).collect())
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn collect_rows<R>(results: Vec<Result<R, sqlx::Error>>) -> DbResult<Vec<R>> {
    let mut rows = Vec::with_capacity(results.len());
    for result in results {
        rows.push(result.map_err(DbError::from)?);
    }
    Ok(rows)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::PgConnection;
    use sqlx::postgres::PgRow;

    pub async fn fetch_rows(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        persistent: bool,
    ) -> DbResult<Vec<PgRow>> {
        // Without params or caching, use the simple protocol so multi-statement text works
        let results = if params.is_empty() && !persistent {
            use sqlx::Executor;
            conn.fetch(sql).collect::<Vec<_>>().await
        } else {
            let mut query = sqlx::query(sql).persistent(persistent);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.fetch(conn).collect::<Vec<_>>().await
        };
        collect_rows(results)
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::SqliteConnection;
    use sqlx::sqlite::SqliteRow;

    pub async fn fetch_rows(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        persistent: bool,
    ) -> DbResult<Vec<SqliteRow>> {
        let results = if params.is_empty() && !persistent {
            use sqlx::Executor;
            conn.fetch(sql).collect::<Vec<_>>().await
        } else {
            let mut query = sqlx::query(sql).persistent(persistent);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.fetch(conn).collect::<Vec<_>>().await
        };
        collect_rows(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::error::identity_transformer;
    use crate::sql::SourceUnit;
    use serde_json::json;

    async fn sqlite_pool(dir: &tempfile::TempDir) -> DbPool {
        let url = format!("sqlite:{}", dir.path().join("exec.db").display());
        let pool = DbPool::connect_lazy(&url, &PoolOptions::default()).unwrap();
        let mut conn = pool.acquire().await.unwrap();
        conn.execute_raw(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB);
             INSERT INTO users VALUES (1, 'ada', 9.5, x'0102'), (2, 'bob', NULL, NULL);",
        )
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_perform_db_call_binds_named_params() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer = identity_transformer();
        let executor = QueryExecutor::new(&pool, None, &transformer);
        let call = DbCall::from_source(
            &SourceUnit::inline("users.find", "SELECT id, name, score, data FROM users WHERE id = :id"),
            false,
        );
        let mut hooks = HookLifecycle::new(&[]);

        let result = executor
            .perform_db_call(&call, &mut hooks, json!({"id": 1}), &CallContext::new(None))
            .await
            .unwrap();

        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["name"], json!("ada"));
        assert_eq!(result.rows[0]["score"], json!(9.5));
        assert_eq!(result.rows[0]["data"], json!("AQI="));
        assert_eq!(result.command, "SELECT id, name, score, data FROM users WHERE id = $1");
    }

    #[tokio::test]
    async fn test_perform_db_call_null_columns_and_expressions() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer = identity_transformer();
        let executor = QueryExecutor::new(&pool, None, &transformer);
        let call = DbCall::raw("SELECT score, count(*) AS total FROM users WHERE id = :id");
        let mut hooks = HookLifecycle::new(&[]);

        let result = executor
            .perform_db_call(&call, &mut hooks, json!({"id": 2}), &CallContext::new(None))
            .await
            .unwrap();

        assert_eq!(result.rows[0]["score"], JsonValue::Null);
        assert_eq!(result.rows[0]["total"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_parameter_is_contextualized() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer = identity_transformer();
        let executor = QueryExecutor::new(&pool, None, &transformer);
        let call = DbCall::from_source(
            &SourceUnit::inline("users.find", "SELECT * FROM users WHERE id = :id"),
            false,
        );
        let mut hooks = HookLifecycle::new(&[]);

        let err = executor
            .perform_db_call(&call, &mut hooks, json!({}), &CallContext::new(None))
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), DbError::MissingParameter { key } if key == "id"));
        let DbError::Query(query_err) = &err else {
            panic!("expected a query error, got {err:?}");
        };
        assert_eq!(query_err.query_name(), "users_find");
        assert!(query_err.context.submit.is_none());
        assert!(query_err.diagnostic.starts_with("[users_find]\n\nSELECT * FROM users WHERE id = :id\n\n"));
        assert!(!query_err.diagnostic.contains("From: "));

        let timings = query_err.diagnostic.lines().nth(4).unwrap();
        assert!(timings.starts_with("started="), "{timings}");
        assert!(timings.contains(" wait="));
        assert!(timings.contains(" active=0ms"));
        assert!(timings.ends_with(&format!(" total={}ms", query_err.context.duration_ms)));
        assert!(query_err.diagnostic.ends_with("Missing expected key [id] on input parameters."));
    }

    #[tokio::test]
    async fn test_error_diagnostic_includes_call_site() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer = identity_transformer();
        let site = CallSite::capture();
        let executor = QueryExecutor::new(&pool, None, &transformer).with_call_site(Some(&site));
        let call = DbCall::raw("SELECT * FROM missing_table");
        let mut hooks = HookLifecycle::new(&[]);

        let err = executor
            .perform_db_call(&call, &mut hooks, json!({}), &CallContext::new(None))
            .await
            .unwrap_err();

        let DbError::Query(query_err) = &err else {
            panic!("expected a query error, got {err:?}");
        };
        assert!(matches!(query_err.cause, DbError::Database { .. }));
        assert!(query_err.context.submit.is_some());
        assert!(query_err.diagnostic.contains(&format!("From: {}", site.location)));
    }

    #[tokio::test]
    async fn test_error_transformer_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer: ErrorTransformer =
            std::sync::Arc::new(|err| DbError::internal(format!("wrapped: {}", err)));
        let executor = QueryExecutor::new(&pool, None, &transformer);
        let call = DbCall::raw("SELECT * FROM missing_table");
        let mut hooks = HookLifecycle::new(&[]);

        let err = executor
            .perform_db_call(&call, &mut hooks, json!({}), &CallContext::new(None))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Internal { message } if message.starts_with("wrapped: ")));
    }

    #[tokio::test]
    async fn test_prepared_call_runs_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir).await;
        let transformer = identity_transformer();
        let executor = QueryExecutor::new(&pool, None, &transformer);
        let call = DbCall::from_source(
            &SourceUnit::inline("users.count", "SELECT count(*) AS n FROM users WHERE id >= :min"),
            true,
        );
        assert!(call.prepared);

        for _ in 0..3 {
            let mut hooks = HookLifecycle::new(&[]);
            let result = executor
                .perform_db_call(&call, &mut hooks, json!({"min": 1}), &CallContext::new(None))
                .await
                .unwrap();
            assert_eq!(result.rows[0]["n"], json!(2));
        }
    }
}
