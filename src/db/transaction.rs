//! Transactions on a pinned connection.
//!
//! A transaction checks one connection out of the pool, issues `BEGIN` on it
//! and shares it with every handle derived for the transaction. When the
//! transaction ends the connection is taken out of the shared slot and goes
//! back to the pool, so derived handles that outlive it can no longer run
//! statements on it.

use crate::db::pool::{DbPool, PinnedConnection, pin};
use crate::error::{DbError, DbResult};
use tracing::{debug, warn};

/// An open transaction.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    connection: PinnedConnection,
    finished: bool,
}

/// Generate a new transaction id, `tx_` followed by 32 hex chars.
pub fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

impl Transaction {
    /// Acquire a connection and start a transaction on it.
    pub async fn begin(id: String, pool: &DbPool) -> DbResult<Self> {
        let mut conn = pool.acquire().await?;
        conn.execute_raw("BEGIN").await?;
        debug!(transaction_id = %id, db_type = %conn.db_type(), "Transaction started");

        Ok(Self {
            id,
            connection: pin(conn),
            finished: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The connection to pin into derived handles.
    pub fn connection(&self) -> &PinnedConnection {
        &self.connection
    }

    /// Commit. On failure the transaction is still open and must be rolled back.
    pub async fn commit(&mut self) -> DbResult<()> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or(DbError::TransactionClosed)?;
        conn.execute_raw("COMMIT").await?;
        self.finished = true;
        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    /// Roll back. A failed rollback is logged and the connection is discarded
    /// rather than returned to the pool.
    pub async fn rollback(&mut self) {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_mut() {
            match conn.execute_raw("ROLLBACK").await {
                Ok(()) => debug!(transaction_id = %self.id, "Transaction rolled back"),
                Err(e) => {
                    warn!(transaction_id = %self.id, error = %e, "Rollback failed, discarding connection");
                    conn.close_on_drop();
                }
            }
        }
        self.finished = true;
    }

    /// Return the connection to the pool.
    ///
    /// Waits for a statement still running through a derived handle. Handles
    /// used afterwards fail with [`DbError::TransactionClosed`].
    pub async fn release(self) {
        let conn = self.connection.lock().await.take();
        if conn.is_some() {
            debug!(transaction_id = %self.id, "Released transaction connection");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The session may still be inside the transaction
        match self.connection.try_lock() {
            Ok(mut slot) => {
                if let Some(mut conn) = slot.take() {
                    conn.close_on_drop();
                }
                warn!(transaction_id = %self.id, "Transaction dropped without commit or rollback");
            }
            Err(_) => warn!(
                transaction_id = %self.id,
                "Transaction dropped while its connection was in use"
            ),
        }
    }
}
