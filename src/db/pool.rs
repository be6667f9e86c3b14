//! Connection pool management.
//!
//! This module wraps the database-specific sqlx pools (PgPool, SqlitePool)
//! and hands out connections as leases. A lease is either a fresh pooled
//! connection, returned to the pool when dropped, or the pinned connection of
//! an open transaction, which stays checked out until the transaction ends.

use crate::config::{PoolOptions, PoolTarget};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Postgres, Sqlite, SqlitePool};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Create a pool that opens connections on first use.
    ///
    /// Must be called from within a Tokio runtime; the pool spawns its
    /// maintenance task immediately.
    pub fn connect_lazy(connection_string: &str, options: &PoolOptions) -> DbResult<Self> {
        let db_type = DatabaseType::from_connection_string(connection_string).ok_or_else(|| {
            DbError::configuration(format!(
                "Unsupported connection string {}: expected a postgres:// or sqlite: URL",
                crate::models::masked_connection_string(connection_string)
            ))
        })?;
        let target = PoolTarget::of(db_type, connection_string);
        let min = options.min_or_default(target);
        let max = options.max_or_default(target);
        let acquire_timeout = options.connection_timeout_or_default();
        let idle_timeout = Some(options.idle_timeout_or_default());
        let keep_alive = options.keep_alive_or_default();

        let pool = match db_type {
            DatabaseType::PostgreSQL => {
                let mut connect = PgConnectOptions::from_str(connection_string).map_err(|e| {
                    DbError::connection(
                        format!("Invalid PostgreSQL connection string: {}", e),
                        connection_suggestion(db_type, &e),
                    )
                })?;
                if let Some(name) = &options.application_name {
                    connect = connect.application_name(name);
                }
                if let Some(ms) = options.statement_timeout_ms {
                    connect = connect.options([("statement_timeout", format!("{}ms", ms))]);
                }

                let pool = PgPoolOptions::new()
                    .min_connections(min)
                    .max_connections(max)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(keep_alive)
                    .connect_lazy_with(connect);
                DbPool::Postgres(pool)
            }
            DatabaseType::SQLite => {
                let connect = SqliteConnectOptions::from_str(connection_string)
                    .map_err(|e| {
                        DbError::connection(
                            format!("Invalid SQLite connection string: {}", e),
                            connection_suggestion(db_type, &e),
                        )
                    })?
                    .create_if_missing(true);
                if options.statement_timeout_ms.is_some() || options.application_name.is_some() {
                    debug!("statement_timeout and application_name are ignored for SQLite");
                }

                let pool = SqlitePoolOptions::new()
                    .min_connections(min)
                    .max_connections(max)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(idle_timeout)
                    .test_before_acquire(keep_alive)
                    .connect_lazy_with(connect);
                DbPool::SQLite(pool)
            }
        };

        info!(
            db_type = %db_type,
            min_connections = min,
            max_connections = max,
            "Created connection pool"
        );
        Ok(pool)
    }

    /// Check a connection out of the pool.
    pub async fn acquire(&self) -> DbResult<DbConnection> {
        let db_type = self.db_type();
        let map_err = |e: sqlx::Error| match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => DbError::from(e),
            other => DbError::connection(
                format!("Failed to connect: {}", other),
                connection_suggestion(db_type, &other),
            ),
        };

        let conn = match self {
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.acquire().await.map_err(map_err)?),
            DbPool::SQLite(pool) => DbConnection::SQLite(pool.acquire().await.map_err(map_err)?),
        };
        debug!(db_type = %db_type, "Acquired connection");
        Ok(conn)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
        info!(db_type = %self.db_type(), "Closed connection pool");
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password in the connection string".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    format!(
        "Verify the connection string format, e.g. {}",
        db_type.example_url()
    )
}

/// A connection checked out of a [`DbPool`].
#[derive(Debug)]
pub enum DbConnection {
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbConnection {
    /// Run a statement without parameters or result rows, such as `BEGIN`.
    pub async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        match self {
            DbConnection::Postgres(conn) => {
                sqlx::Executor::execute(&mut **conn, sql).await?;
            }
            DbConnection::SQLite(conn) => {
                sqlx::Executor::execute(&mut **conn, sql).await?;
            }
        }
        Ok(())
    }

    /// Discard the connection instead of returning it to the pool.
    ///
    /// Used when the session state is unknown, e.g. after a failed rollback.
    pub fn close_on_drop(&mut self) {
        match self {
            DbConnection::Postgres(conn) => conn.close_on_drop(),
            DbConnection::SQLite(conn) => conn.close_on_drop(),
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// The connection of an open transaction, shared by every derived handle.
///
/// The slot is emptied when the transaction ends, which hands the connection
/// back to the pool even if a derived handle is still alive.
pub type PinnedConnection = Arc<Mutex<Option<DbConnection>>>;

/// Pin `conn` for a new transaction.
pub fn pin(conn: DbConnection) -> PinnedConnection {
    Arc::new(Mutex::new(Some(conn)))
}

/// A connection held for the duration of one call.
#[derive(Debug)]
pub enum ConnectionLease {
    /// Returned to the pool on release
    Pooled(DbConnection),
    /// Unlocked on release; the transaction keeps the connection
    Pinned(OwnedMappedMutexGuard<Option<DbConnection>, DbConnection>),
}

impl ConnectionLease {
    /// Lock the pinned connection if there is one, otherwise check one out.
    ///
    /// Fails with [`DbError::TransactionClosed`] when the pinned slot was
    /// already released by its transaction.
    pub async fn acquire(pool: &DbPool, pinned: Option<&PinnedConnection>) -> DbResult<Self> {
        match pinned {
            Some(slot) => {
                let guard = Arc::clone(slot).lock_owned().await;
                OwnedMutexGuard::try_map(guard, Option::as_mut)
                    .map(Self::Pinned)
                    .map_err(|_| DbError::TransactionClosed)
            }
            None => Ok(Self::Pooled(pool.acquire().await?)),
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, Self::Pinned(_))
    }

    /// Give the connection back. Dropping the lease has the same effect.
    pub fn release(self) {
        if !self.is_pinned() {
            debug!("Released connection to pool");
        }
    }
}

impl Deref for ConnectionLease {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        match self {
            Self::Pooled(conn) => conn,
            Self::Pinned(guard) => &**guard,
        }
    }
}

impl DerefMut for ConnectionLease {
    fn deref_mut(&mut self) -> &mut DbConnection {
        match self {
            Self::Pooled(conn) => conn,
            Self::Pinned(guard) => &mut **guard,
        }
    }
}
