//! Parameter resolution and binding.
//!
//! Named parameters are looked up in the caller's JSON object by path and
//! converted to positional `QueryParam`s in mapping order. The bind helpers
//! then attach them to driver-specific query objects.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use crate::sql::DbCall;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{Postgres, Sqlite};

/// Look up a parameter path such as `user.id`, `items[0].sku` or `items.0`.
///
/// A key containing dots is tried literally first, so `{"user.id": 1}`
/// resolves `user.id` without nesting. Returns `None` when any segment is
/// absent; a present JSON `null` is returned as `Some(Null)`.
pub fn lookup<'a>(params: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let literal = travel(params, path, &['[', ']', ',']);
    if literal.is_some() {
        return literal;
    }
    travel(params, path, &['[', ']', ',', '.'])
}

fn travel<'a>(params: &'a JsonValue, path: &str, separators: &[char]) -> Option<&'a JsonValue> {
    path.split(|c| separators.contains(&c))
        .filter(|segment| !segment.is_empty())
        .try_fold(params, |value, segment| match value {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Resolve every mapped parameter of `db_call` against `params`.
///
/// Values are returned in positional order (`$1` first).
pub fn resolve_params(db_call: &DbCall, params: &JsonValue) -> DbResult<Vec<QueryParam>> {
    db_call
        .mapping
        .iter()
        .map(|m| {
            lookup(params, &m.name)
                .map(QueryParam::from)
                .ok_or_else(|| DbError::missing_parameter(&m.name))
        })
        .collect()
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}
