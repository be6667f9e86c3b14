//! The `TinySql` handle.
//!
//! A handle owns nothing but shared references: the pool, the compiled
//! registry and the configured callbacks live in one `Arc` shared by every
//! clone. Handles derived for a transaction additionally carry the pinned
//! connection, so calls made through them run inside the transaction.
//!
//! ```no_run
//! use serde_json::json;
//! use tinysql::{DbError, TinyOptions, TinySql};
//!
//! # async fn run() -> Result<(), DbError> {
//! let db = TinySql::new(
//!     TinyOptions::new()
//!         .connection_string("sqlite:app.db")
//!         .root_dir("sql"),
//! )?;
//!
//! let users = db.sql("users.find_by_id", json!({"id": 1})).await?;
//!
//! db.transaction(|tx| async move {
//!     tx.sql("users.insert", json!({"name": "ada"})).await?;
//!     tx.query("UPDATE stats SET users = users + 1", json!({})).await?;
//!     Ok::<_, DbError>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::TinyOptions;
use crate::db::{DbPool, PinnedConnection, QueryExecutor, Transaction, generate_transaction_id};
use crate::error::{DbError, DbResult, ErrorTransformer, identity_transformer};
use crate::hooks::{CallArgs, HookLifecycle, TinyHooks};
use crate::models::{CallContext, CallSite, DatabaseType, QueryResult, masked_connection_string};
use crate::sql::{DbCall, QueryRegistry, SourceUnit, load_sql_files};
use serde_json::Value as JsonValue;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

struct Shared {
    pool: DbPool,
    registry: QueryRegistry,
    capture_stack_trace: bool,
    error_transformer: ErrorTransformer,
}

/// Handle for running named and raw queries. Cheap to clone.
#[derive(Clone)]
pub struct TinySql {
    shared: Arc<Shared>,
    hooks: Arc<Vec<Arc<dyn TinyHooks>>>,
    pinned: Option<PinnedConnection>,
    transaction_id: Option<String>,
}

impl std::fmt::Debug for TinySql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinySql")
            .field("db_type", &self.shared.pool.db_type())
            .field("queries", &self.shared.registry.len())
            .field("hooks", &self.hooks.len())
            .field("transaction_id", &self.transaction_id)
            .finish_non_exhaustive()
    }
}

impl TinySql {
    /// Load every SQL source and create the connection pool.
    ///
    /// Sources are loaded and compiled first, so a duplicate name fails
    /// before any pool exists. The pool connects lazily; it must be created
    /// inside a Tokio runtime.
    pub fn new(options: TinyOptions) -> DbResult<Self> {
        let mut sources: Vec<SourceUnit> = options
            .inline_sources
            .iter()
            .map(|(key, text)| SourceUnit::inline(key.clone(), text.clone()))
            .collect();
        sources.extend(load_sql_files(&options.root_dirs)?);
        let registry = QueryRegistry::build(&sources, options.use_prepared_statements)?;

        let (connection_string, pool_options) = options.resolve_connection()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DbError::configuration(
                "TinySql::new must be called from within a Tokio runtime",
            ));
        }
        let pool = DbPool::connect_lazy(&connection_string, &pool_options)?;

        info!(
            connection = %masked_connection_string(&connection_string),
            queries = registry.len(),
            hooks = options.hooks.len(),
            "TinySql ready"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                registry,
                capture_stack_trace: options.capture_stack_trace,
                error_transformer: options
                    .error_transformer
                    .unwrap_or_else(identity_transformer),
            }),
            hooks: Arc::new(options.hooks),
            pinned: None,
            transaction_id: None,
        })
    }

    /// Run the named query `name` (e.g. `users.find_by_id`) with `params`.
    ///
    /// Fails with [`DbError::QueryNotFound`] for an unknown key; execution
    /// failures come back as [`DbError::Query`] after the error transformer.
    #[track_caller]
    pub fn sql<'a>(
        &'a self,
        name: &str,
        params: JsonValue,
    ) -> impl Future<Output = DbResult<QueryResult>> + Send + use<'a> {
        let call_site = self.capture_call_site();
        let args = CallArgs {
            name_or_sql: name.to_string(),
            params,
        };
        async move { self.run_named(args, call_site).await }
    }

    /// Run ad hoc SQL text with `:name` parameters.
    #[track_caller]
    pub fn query<'a>(
        &'a self,
        sql: &str,
        params: JsonValue,
    ) -> impl Future<Output = DbResult<QueryResult>> + Send + use<'a> {
        let call_site = self.capture_call_site();
        let args = CallArgs {
            name_or_sql: sql.to_string(),
            params,
        };
        async move { self.run_raw(args, call_site).await }
    }

    /// Run `work` inside a transaction.
    ///
    /// The handle passed to `work` runs every call on the transaction's
    /// connection. The transaction commits if `work` succeeds and rolls back
    /// otherwise, returning the original error. Called on a handle that is
    /// already inside a transaction, `work` joins the enclosing transaction.
    pub async fn transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(TinySql) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + Display,
    {
        self.transaction_deferred(|tx| Some(work(tx))).await
    }

    /// Like [`TinySql::transaction`], for workers that may decline to start.
    ///
    /// A worker returning `None` rolls the transaction back and fails with
    /// [`DbError::NotAwaitable`].
    pub async fn transaction_deferred<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(TinySql) -> Option<Fut>,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + Display,
    {
        if let Some(pinned) = &self.pinned {
            if pinned.lock().await.is_none() {
                return Err(E::from(DbError::TransactionClosed));
            }
            debug!(transaction_id = ?self.transaction_id, "Joining enclosing transaction");
            return match work(self.clone()) {
                Some(fut) => fut.await,
                None => Err(E::from(DbError::NotAwaitable)),
            };
        }

        let id = generate_transaction_id();
        let mut hooks = HookLifecycle::new(&self.hooks);
        hooks.pre_transaction(&id);

        let mut tx = Transaction::begin(id.clone(), &self.shared.pool)
            .await
            .map_err(E::from)?;
        hooks.on_begin(&id);

        let handle = TinySql {
            shared: Arc::clone(&self.shared),
            hooks: Arc::clone(&self.hooks),
            pinned: Some(Arc::clone(tx.connection())),
            transaction_id: Some(id.clone()),
        };

        let outcome = match work(handle) {
            Some(fut) => fut.await,
            None => Err(E::from(DbError::NotAwaitable)),
        };

        let outcome = match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    hooks.on_commit(&id);
                    Ok(value)
                }
                Err(e) => Err(E::from(e)),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            debug!(transaction_id = %id, error = %e, "Rolling back transaction");
            tx.rollback().await;
            hooks.on_rollback(&id, e);
        }
        tx.release().await;
        outcome
    }

    /// A new handle with `hooks` added after the existing ones.
    ///
    /// The original handle is unchanged.
    pub fn with_hooks(&self, hooks: impl TinyHooks + 'static) -> TinySql {
        let mut all = self.hooks.to_vec();
        all.push(Arc::new(hooks));
        TinySql {
            hooks: Arc::new(all),
            ..self.clone()
        }
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.shared.registry
    }

    pub fn db_type(&self) -> DatabaseType {
        self.shared.pool.db_type()
    }

    /// Id of the enclosing transaction, if this handle belongs to one.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Close the pool shared by this handle and all of its clones.
    pub async fn close(&self) {
        self.shared.pool.close().await;
    }

    #[track_caller]
    fn capture_call_site(&self) -> Option<CallSite> {
        if self.shared.capture_stack_trace {
            Some(CallSite::capture())
        } else {
            None
        }
    }

    fn executor<'a>(&'a self, call_site: Option<&'a CallSite>) -> QueryExecutor<'a> {
        QueryExecutor::new(
            &self.shared.pool,
            self.pinned.as_ref(),
            &self.shared.error_transformer,
        )
        .with_call_site(call_site)
    }

    async fn run_named(&self, args: CallArgs, call_site: Option<CallSite>) -> DbResult<QueryResult> {
        let call = CallContext::new(self.transaction_id.clone());
        let mut hooks = HookLifecycle::new(&self.hooks);
        let args = hooks.pre_sql(&call, args)?;

        let db_call = self
            .shared
            .registry
            .get(&args.name_or_sql)
            .ok_or_else(|| DbError::query_not_found(&args.name_or_sql))?;

        self.executor(call_site.as_ref())
            .perform_db_call(&db_call, &mut hooks, args.params, &call)
            .await
    }

    async fn run_raw(&self, args: CallArgs, call_site: Option<CallSite>) -> DbResult<QueryResult> {
        let call = CallContext::new(self.transaction_id.clone());
        let mut hooks = HookLifecycle::new(&self.hooks);
        let args = hooks.pre_raw_query(&call, args)?;

        let db_call = DbCall::raw(&args.name_or_sql);
        self.executor(call_site.as_ref())
            .perform_db_call(&db_call, &mut hooks, args.params, &call)
            .await
    }
}
