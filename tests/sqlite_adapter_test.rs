//! Adapter-level tests on SQLite: raw SQL, transactions, savepoints,
//! pool status, the connection manager and query logging.

use omnidb::db::TransactionState;
use omnidb::logging::{QueryLogEntry, QueryLogger};
use omnidb::{
    Adapter, ConnectionConfig, DatabaseManager, DbError, ExecuteRequest, QueryParam, QueryRequest,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

fn temp_db_path() -> String {
    let temp_file = NamedTempFile::new().unwrap();
    temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn setup_db() -> Adapter {
    let adapter = Adapter::open(ConnectionConfig::sqlite(temp_db_path()))
        .await
        .unwrap();
    adapter
        .execute(ExecuteRequest::sql(
            "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, qty INTEGER)",
            vec![],
        ))
        .await
        .unwrap();
    adapter
}

async fn insert(adapter: &Adapter, name: &str) {
    adapter
        .execute(ExecuteRequest::sql(
            "INSERT INTO items (name, qty) VALUES (?, ?)",
            vec![QueryParam::String(name.to_string()), QueryParam::Int(1)],
        ))
        .await
        .unwrap();
}

async fn names(adapter: &Adapter) -> Vec<String> {
    adapter
        .query(QueryRequest::sql("SELECT name FROM items ORDER BY id", vec![]))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_execute_and_query() {
    let adapter = setup_db().await;

    let result = adapter
        .execute(ExecuteRequest::sql(
            "INSERT INTO items (name, qty) VALUES (?, ?)",
            vec![QueryParam::String("bolt".into()), QueryParam::Int(10)],
        ))
        .await
        .unwrap();
    assert_eq!(result.affected_rows, 1);
    assert_eq!(result.insert_id, Some(json!(1)));

    let rows = adapter
        .query(QueryRequest::sql(
            "SELECT id, name, qty FROM items WHERE qty > ?",
            vec![QueryParam::Int(5)],
        ))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("bolt"));
    assert_eq!(rows[0]["qty"], json!(10));

    let err = adapter
        .query(QueryRequest::sql("SELECT * FROM missing_table", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Query { .. }));

    let err = adapter
        .execute(ExecuteRequest::sql(
            "INSERT INTO missing_table (name) VALUES (?)",
            vec![QueryParam::String("nut".into())],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Execution { .. }));
}

#[tokio::test]
async fn test_commit_and_rollback() {
    let adapter = setup_db().await;

    let tx = adapter.begin().await.unwrap();
    assert!(tx.in_transaction());
    assert!(!adapter.in_transaction());
    insert(&tx, "kept").await;
    tx.commit().await.unwrap();
    assert_eq!(tx.transaction_state().await, TransactionState::Committed);

    let tx = adapter.begin().await.unwrap();
    insert(&tx, "dropped").await;
    tx.rollback().await.unwrap();
    assert_eq!(tx.transaction_state().await, TransactionState::RolledBack);

    assert_eq!(names(&adapter).await, vec!["kept"]);

    // A finished handle rejects further work
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    assert!(adapter.commit().await.is_err());
}

#[tokio::test]
async fn test_savepoint_rollback_keeps_earlier_writes() {
    let adapter = setup_db().await;

    let tx = adapter.begin().await.unwrap();
    insert(&tx, "before").await;
    tx.create_savepoint("s1").await.unwrap();
    insert(&tx, "undone").await;
    tx.rollback_to_savepoint("s1").await.unwrap();
    insert(&tx, "after").await;
    tx.commit().await.unwrap();

    assert_eq!(names(&adapter).await, vec!["before", "after"]);
}

#[tokio::test]
async fn test_nested_transaction_uses_savepoint() {
    let adapter = setup_db().await;

    adapter
        .transaction(|tx| async move {
            insert(&tx, "outer").await;
            let inner: Result<(), DbError> = tx
                .transaction(|inner| async move {
                    insert(&inner, "inner").await;
                    Err(DbError::invalid_input("abort inner"))
                })
                .await;
            assert!(inner.is_err());
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    assert_eq!(names(&adapter).await, vec!["outer"]);
}

#[tokio::test]
async fn test_savepoints_unsupported_on_document_backend() {
    let adapter = Adapter::new(
        "docs",
        ConnectionConfig::from_url("mongodb://localhost:27017/app").unwrap(),
    );
    let err = adapter.create_savepoint("s1").await.unwrap_err();
    assert!(matches!(err, DbError::SavepointUnsupported { .. }));
    let err = adapter.rollback_to_savepoint("s1").await.unwrap_err();
    assert!(matches!(err, DbError::SavepointUnsupported { .. }));
    let err = adapter.release_savepoint("s1").await.unwrap_err();
    assert!(matches!(err, DbError::SavepointUnsupported { .. }));
}

#[tokio::test]
async fn test_pool_status_and_health() {
    let adapter = setup_db().await;

    let status = adapter.pool_status();
    assert!(status.is_consistent());
    assert!(status.max >= 1);

    let tx = adapter.begin().await.unwrap();
    let during = adapter.pool_status();
    assert!(during.is_consistent());
    tx.rollback().await.unwrap();

    let health = adapter.health_check().await;
    assert!(health.healthy, "{:?}", health.error);
}

#[tokio::test]
async fn test_manager_registry() {
    let manager = DatabaseManager::new();
    let config = ConnectionConfig::sqlite(temp_db_path());

    manager.init_database(config.clone(), None).await.unwrap();
    manager
        .init_database(ConnectionConfig::sqlite(temp_db_path()), Some("reports"))
        .await
        .unwrap();

    assert!(manager.contains("default").await);
    assert!(manager.contains("reports").await);
    assert_eq!(manager.len().await, 2);
    assert!(manager.default_database().await.unwrap().is_connected());

    let err = manager.get_database("nope").await.unwrap_err();
    assert!(matches!(err, DbError::ConnectionNotFound { .. }));

    manager.close_database(Some("reports")).await.unwrap();
    assert!(!manager.contains("reports").await);
    assert_eq!(manager.len().await, 1);
}

#[derive(Default)]
struct RecordingLogger {
    entries: Mutex<Vec<QueryLogEntry>>,
}

impl QueryLogger for RecordingLogger {
    fn log(&self, entry: &QueryLogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

#[tokio::test]
async fn test_query_logger_sees_successes_and_failures() {
    let adapter = setup_db().await;
    let logger = Arc::new(RecordingLogger::default());
    adapter.set_query_logger(logger.clone());

    insert(&adapter, "logged").await;
    let _ = adapter
        .query(QueryRequest::sql("SELECT * FROM missing_table", vec![]))
        .await;

    {
        let entries = logger.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "execute");
        assert!(entries[0].success);
        assert!(entries[0].target.starts_with("INSERT INTO items"));
        assert_eq!(entries[1].operation, "query");
        assert!(!entries[1].success);
        assert!(entries[1].error.is_some());
    }

    adapter.clear_query_logger();
    insert(&adapter, "unlogged").await;
    assert_eq!(logger.entries.lock().unwrap().len(), 2);
}
