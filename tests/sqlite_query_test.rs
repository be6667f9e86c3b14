//! Integration tests for named and raw queries against SQLite.

use serde_json::json;
use std::path::Path;
use tinysql::config::PoolOptions;
use tinysql::{DbError, TinyOptions, TinySql};

fn write_sql(root: &Path, relative: &str, text: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}

fn sqlite_options(dir: &tempfile::TempDir) -> TinyOptions {
    TinyOptions::new().connection_string(format!(
        "sqlite:{}",
        dir.path().join("test.db").display()
    ))
}

async fn setup(db: &TinySql) {
    db.query(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER, active BOOLEAN)",
        json!({}),
    )
    .await
    .unwrap();
    for (name, age) in [("ada", 36), ("bob", 25), ("cy", 41)] {
        db.query(
            "INSERT INTO users (name, age, active) VALUES (:name, :age, :active)",
            json!({"name": name, "age": age, "active": true}),
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_named_queries_from_root_dir() {
    let dir = tempfile::tempdir().unwrap();
    let sql_dir = dir.path().join("sql");
    write_sql(&sql_dir, "users/find_by_name.sql", "SELECT id, name, age FROM users WHERE name = :name");
    write_sql(&sql_dir, "users/count.sql", "SELECT count(*) AS total FROM users");

    let db = TinySql::new(sqlite_options(&dir).root_dir(&sql_dir)).unwrap();
    setup(&db).await;

    assert!(db.registry().contains("users.find_by_name"));
    assert!(db.registry().contains("users.count"));

    let result = db.sql("users.find_by_name", json!({"name": "bob"})).await.unwrap();
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["age"], json!(25));

    let result = db.sql("users.count", json!({})).await.unwrap();
    assert_eq!(result.rows[0]["total"], json!(3));
}

#[tokio::test]
async fn test_multiple_root_dirs_are_merged() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    write_sql(&first, "users/all.sql", "SELECT name FROM users ORDER BY id");
    write_sql(&second, "stats/oldest.sql", "SELECT max(age) AS age FROM users");

    let db = TinySql::new(sqlite_options(&dir).root_dir(&first).root_dir(&second)).unwrap();
    setup(&db).await;

    let keys: Vec<&str> = db.registry().keys().collect();
    assert_eq!(keys, vec!["stats.oldest", "users.all"]);

    let result = db.sql("stats.oldest", json!({})).await.unwrap();
    assert_eq!(result.rows[0]["age"], json!(41));
}

#[tokio::test]
async fn test_conflicting_paths_across_roots_fail() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    write_sql(&first, "users/all.sql", "SELECT 1");
    write_sql(&second, "users/all.sql", "SELECT 2");

    let err = TinySql::new(sqlite_options(&dir).root_dir(&first).root_dir(&second)).unwrap_err();
    match err {
        DbError::DuplicateName { conflicts } => {
            assert_eq!(conflicts, vec!["users/all.sql", "users/all.sql"]);
        }
        other => panic!("expected DuplicateName, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_root_dir_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = TinySql::new(sqlite_options(&dir).root_dir(dir.path().join("nope"))).unwrap_err();
    assert!(matches!(err, DbError::Io { .. }));
}

#[tokio::test]
async fn test_repeated_and_nested_params() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();
    setup(&db).await;

    let result = db
        .query(
            "SELECT name FROM users WHERE age >= :filter.min AND age <= :filter.max AND (:filter.min > 0 OR name = :names.0) ORDER BY age",
            json!({"filter": {"min": 30, "max": 40}, "names": ["ada"]}),
        )
        .await
        .unwrap();

    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["name"], json!("ada"));
    assert!(result.command.contains("$1") && result.command.contains("$3"));
}

#[tokio::test]
async fn test_null_param_binds_null() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();
    setup(&db).await;

    db.query(
        "INSERT INTO users (name, age) VALUES (:name, :age)",
        json!({"name": "dee", "age": null}),
    )
    .await
    .unwrap();

    let result = db
        .query("SELECT age, active FROM users WHERE name = :name", json!({"name": "dee"}))
        .await
        .unwrap();
    assert_eq!(result.rows[0]["age"], serde_json::Value::Null);
    assert_eq!(result.rows[0]["active"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_boolean_column_decodes_as_bool() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();
    setup(&db).await;

    let result = db
        .query("SELECT active FROM users WHERE name = :name", json!({"name": "ada"}))
        .await
        .unwrap();
    assert_eq!(result.rows[0]["active"], json!(true));
}

#[tokio::test]
async fn test_json_param_is_bound_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();

    let result = db
        .query(
            "SELECT json_extract(:doc, '$.a') AS a",
            json!({"doc": {"a": 5}}),
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0]["a"], json!(5));
}

#[tokio::test]
async fn test_missing_param_reports_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(
        sqlite_options(&dir).inline_source("users.by_age", "SELECT * FROM users WHERE age = :age"),
    )
    .unwrap();
    setup(&db).await;

    let err = db.sql("users.by_age", json!({"agee": 3})).await.unwrap_err();
    assert!(matches!(err.root_cause(), DbError::MissingParameter { key } if key == "age"));
    assert_eq!(
        err.to_string(),
        "Missing expected key [age] on input parameters."
    );
    assert_eq!(err.query_context().map(|c| c.begin.name.as_str()), Some("users_by_age"));
}

#[tokio::test]
async fn test_unknown_name_is_not_transformed() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(
        sqlite_options(&dir).error_transformer(|err| DbError::internal(format!("mapped: {err}"))),
    )
    .unwrap();

    let err = db.sql("users.nothing", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Sql query with name [users.nothing] not found!");
}

#[derive(Debug, thiserror::Error)]
#[error("app error: {0}")]
struct AppError(String);

#[tokio::test]
async fn test_error_transformer_retypes_execution_errors() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(
        sqlite_options(&dir).error_transformer(|err| DbError::custom(AppError(err.to_string()))),
    )
    .unwrap();

    let err = db.query("SELECT * FROM no_such_table", json!({})).await.unwrap_err();
    match &err {
        DbError::Custom(inner) => {
            let app = inner.downcast_ref::<AppError>().unwrap();
            assert!(app.0.contains("no_such_table"));
        }
        other => panic!("expected a custom error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stack_capture_appends_call_site() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(
        sqlite_options(&dir)
            .capture_stack_trace(true)
            .inline_source("broken", "SELECT * FROM no_such_table WHERE id = :id"),
    )
    .unwrap();

    let err = db.sql("broken", json!({"id": 1})).await.unwrap_err();
    let DbError::Query(query_err) = &err else {
        panic!("expected a query error, got {err:?}");
    };
    assert!(query_err.diagnostic.starts_with("[broken]\n\nSELECT * FROM no_such_table WHERE id = :id\n\n"));
    assert!(query_err.diagnostic.contains(&format!("\n\nFrom: {}:", file!())));
}

#[tokio::test]
async fn test_stack_capture_disabled_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();

    let err = db.query("SELECT * FROM no_such_table", json!({})).await.unwrap_err();
    let DbError::Query(query_err) = &err else {
        panic!("expected a query error, got {err:?}");
    };
    assert!(!query_err.diagnostic.contains("From: "));
    assert!(query_err.diagnostic.starts_with("[raw_query]"));
}

#[tokio::test]
async fn test_prepared_statements_return_same_results() {
    let dir = tempfile::tempdir().unwrap();
    let options = sqlite_options(&dir)
        .use_prepared_statements(true)
        .inline_source("users.older_than", "SELECT name FROM users WHERE age > :age ORDER BY name");
    let db = TinySql::new(options).unwrap();
    setup(&db).await;

    let call = db.registry().get("users.older_than").unwrap();
    let prepared_name = call.prepared_name.clone().unwrap();
    assert!(prepared_name.starts_with("users_older_than_"));
    assert!(prepared_name.len() <= 63);

    for _ in 0..3 {
        let result = db.sql("users.older_than", json!({"age": 30})).await.unwrap();
        let names: Vec<_> = result.rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("ada"), json!("cy")]);
    }
}

#[tokio::test]
async fn test_concurrent_calls_share_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let options = sqlite_options(&dir)
        .pool_options(PoolOptions {
            max: Some(4),
            ..PoolOptions::default()
        })
        .inline_source("users.by_name", "SELECT age FROM users WHERE name = :name");
    let db = TinySql::new(options).unwrap();
    setup(&db).await;

    let names = ["ada", "bob", "cy"];
    let calls = (0..24).map(|i| {
        let db = db.clone();
        let name = names[i % names.len()];
        async move { db.sql("users.by_name", json!({"name": name})).await }
    });
    let results = futures_util::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let result = result.unwrap();
        let expected = [36, 25, 41][i % 3];
        assert_eq!(result.rows[0]["age"], json!(expected));
    }
}

#[tokio::test]
async fn test_spawned_calls_are_send() {
    let dir = tempfile::tempdir().unwrap();
    let db = TinySql::new(sqlite_options(&dir)).unwrap();

    let handle = tokio::spawn({
        let db = db.clone();
        async move { db.query("SELECT :n AS n", json!({"n": 7})).await }
    });
    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.rows[0]["n"], json!(7));
}
