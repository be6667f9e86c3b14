//! Lifecycle hooks.
//!
//! A [`TinyHooks`] implementation observes, and for the `pre_*` callbacks may
//! rewrite, every call made through a handle. Every method has a no-op
//! default so an implementation only overrides what it needs.
//!
//! Each hook set gets two private context slots per call or transaction, one
//! for query callbacks and one for transaction callbacks. Whatever a hook
//! stores in `pre_sql` it sees again in `on_query`, `on_submit` and
//! `on_result` for the same call.
//!
//! # Example
//!
//! ```
//! use tinysql::hooks::{HookContext, HookResult, TinyHooks};
//! use tinysql::models::{QueryBeginContext, QueryCompleteContext};
//! use std::time::Instant;
//!
//! struct Timer;
//!
//! impl TinyHooks for Timer {
//!     fn on_query(&self, ctx: &mut HookContext, _begin: &QueryBeginContext) -> HookResult {
//!         *ctx = Some(Box::new(Instant::now()));
//!         Ok(())
//!     }
//!
//!     fn on_result(&self, ctx: &mut HookContext, complete: &QueryCompleteContext) -> HookResult {
//!         if let Some(started) = ctx.as_ref().and_then(|c| c.downcast_ref::<Instant>()) {
//!             println!("{} took {:?}", complete.begin.name, started.elapsed());
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use crate::error::{DbError, DbResult};
use crate::models::{CallContext, QueryBeginContext, QueryCompleteContext, QuerySubmitContext};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Per-hook state carried between the callbacks of one call or transaction.
pub type HookContext = Option<Box<dyn Any + Send + Sync>>;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type HookResult<T = ()> = Result<T, HookError>;

/// The `(name_or_sql, params)` pair threaded through the `pre_*` hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    /// Query key for `sql()`, SQL text for `query()`
    pub name_or_sql: String,
    pub params: JsonValue,
}

/// Observer and rewriter of handle calls.
///
/// Notification callbacks that fail or panic are logged and skipped; they
/// never change the outcome of the call. A failing `pre_*` callback aborts
/// the call with [`DbError::HookCallback`].
pub trait TinyHooks: Send + Sync {
    /// Runs before a named query is resolved. May replace the key or params.
    fn pre_sql(
        &self,
        _ctx: &mut HookContext,
        _call: &CallContext,
        _args: &mut CallArgs,
    ) -> HookResult {
        Ok(())
    }

    /// Runs before raw SQL is parsed. May replace the text or params.
    fn pre_raw_query(
        &self,
        _ctx: &mut HookContext,
        _call: &CallContext,
        _args: &mut CallArgs,
    ) -> HookResult {
        Ok(())
    }

    /// A connection has been acquired for the call.
    fn on_query(&self, _ctx: &mut HookContext, _begin: &QueryBeginContext) -> HookResult {
        Ok(())
    }

    /// The statement is about to be sent to the driver.
    fn on_submit(&self, _ctx: &mut HookContext, _submit: &QuerySubmitContext) -> HookResult {
        Ok(())
    }

    /// The call finished, successfully or not. Fires exactly once per call.
    fn on_result(&self, _ctx: &mut HookContext, _complete: &QueryCompleteContext) -> HookResult {
        Ok(())
    }

    fn pre_transaction(&self, _ctx: &mut HookContext, _transaction_id: &str) -> HookResult {
        Ok(())
    }

    fn on_begin(&self, _ctx: &mut HookContext, _transaction_id: &str) -> HookResult {
        Ok(())
    }

    fn on_commit(&self, _ctx: &mut HookContext, _transaction_id: &str) -> HookResult {
        Ok(())
    }

    fn on_rollback(
        &self,
        _ctx: &mut HookContext,
        _transaction_id: &str,
        _error: &dyn Display,
    ) -> HookResult {
        Ok(())
    }
}

struct HookEntry {
    hooks: Arc<dyn TinyHooks>,
    ctx: HookContext,
    transaction_ctx: HookContext,
}

/// The hooks of one handle, bound to fresh contexts for a single call or
/// transaction.
pub struct HookLifecycle {
    entries: Vec<HookEntry>,
}

impl std::fmt::Debug for HookLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookLifecycle")
            .field("hook_sets", &self.entries.len())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Query,
    Transaction,
}

impl HookLifecycle {
    pub fn new(hooks: &[Arc<dyn TinyHooks>]) -> Self {
        Self {
            entries: hooks
                .iter()
                .map(|hooks| HookEntry {
                    hooks: Arc::clone(hooks),
                    ctx: None,
                    transaction_ctx: None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pre_sql(&mut self, call: &CallContext, args: CallArgs) -> DbResult<CallArgs> {
        self.pre_hook("pre_sql", args, |hooks, ctx, args| hooks.pre_sql(ctx, call, args))
    }

    pub fn pre_raw_query(&mut self, call: &CallContext, args: CallArgs) -> DbResult<CallArgs> {
        self.pre_hook("pre_raw_query", args, |hooks, ctx, args| {
            hooks.pre_raw_query(ctx, call, args)
        })
    }

    pub fn on_query(&mut self, begin: &QueryBeginContext) {
        self.broadcast("on_query", Slot::Query, |hooks, ctx| hooks.on_query(ctx, begin));
    }

    pub fn on_submit(&mut self, submit: &QuerySubmitContext) {
        self.broadcast("on_submit", Slot::Query, |hooks, ctx| {
            hooks.on_submit(ctx, submit)
        });
    }

    pub fn on_result(&mut self, complete: &QueryCompleteContext) {
        self.broadcast("on_result", Slot::Query, |hooks, ctx| {
            hooks.on_result(ctx, complete)
        });
    }

    pub fn pre_transaction(&mut self, transaction_id: &str) {
        self.broadcast("pre_transaction", Slot::Transaction, |hooks, ctx| {
            hooks.pre_transaction(ctx, transaction_id)
        });
    }

    pub fn on_begin(&mut self, transaction_id: &str) {
        self.broadcast("on_begin", Slot::Transaction, |hooks, ctx| {
            hooks.on_begin(ctx, transaction_id)
        });
    }

    pub fn on_commit(&mut self, transaction_id: &str) {
        self.broadcast("on_commit", Slot::Transaction, |hooks, ctx| {
            hooks.on_commit(ctx, transaction_id)
        });
    }

    pub fn on_rollback(&mut self, transaction_id: &str, error: &dyn Display) {
        self.broadcast("on_rollback", Slot::Transaction, |hooks, ctx| {
            hooks.on_rollback(ctx, transaction_id, error)
        });
    }

    /// Thread `args` through every hook in order. The first failure aborts.
    fn pre_hook(
        &mut self,
        hook: &'static str,
        mut args: CallArgs,
        f: impl Fn(&dyn TinyHooks, &mut HookContext, &mut CallArgs) -> HookResult,
    ) -> DbResult<CallArgs> {
        for entry in &mut self.entries {
            let hooks = entry.hooks.as_ref();
            let ctx = &mut entry.ctx;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(hooks, ctx, &mut args)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(DbError::hook_callback(hook, e.to_string())),
                Err(payload) => {
                    return Err(DbError::hook_callback(hook, panic_message(payload.as_ref())));
                }
            }
        }
        Ok(args)
    }

    /// Notify every hook in order; failures are logged and skipped.
    fn broadcast(
        &mut self,
        hook: &'static str,
        slot: Slot,
        f: impl Fn(&dyn TinyHooks, &mut HookContext) -> HookResult,
    ) {
        for entry in &mut self.entries {
            let hooks = entry.hooks.as_ref();
            let ctx = match slot {
                Slot::Query => &mut entry.ctx,
                Slot::Transaction => &mut entry.transaction_ctx,
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(hooks, ctx)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => DbError::hook_callback(hook, e.to_string()),
                Err(payload) => DbError::hook_callback(hook, panic_message(payload.as_ref())),
            };
            warn!(hook, error = %failure, "Hook callback failed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
