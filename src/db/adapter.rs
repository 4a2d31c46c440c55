//! The uniform data-access contract.
//!
//! An `Adapter` is a cheap clonable handle to one configured backend. Clones
//! share the pool/client; a handle returned by `begin()` (or passed to a
//! `transaction` callback) is additionally bound to one `TransactionContext`
//! and routes every operation through its reserved connection or session.

use crate::config::{ConnectionConfig, DatabaseType};
use crate::db::document::DocumentBackend;
use crate::db::pool::{DbPool, PoolState};
use crate::db::retry::RetryPolicy;
use crate::db::sql::{SqlBackend, create_index_sql, drop_index_sql};
use crate::db::transaction::{TransactionContext, TransactionState};
use crate::db::value::{
    ExecuteRequest, ExecuteResult, HealthCheckResult, IndexSpec, QueryParam, QueryRequest, Record,
};
use crate::error::{DbError, DbResult};
use crate::logging::{QueryLogEntry, QueryLogger};
use mongodb::ClientSession;
use serde_json::Value as JsonValue;
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A connected backend.
#[derive(Debug, Clone)]
pub enum Backend {
    Sql(SqlBackend),
    Document(DocumentBackend),
}

impl Backend {
    async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        if config.db_type.is_sql() {
            Ok(Self::Sql(SqlBackend::connect(config).await?))
        } else {
            Ok(Self::Document(DocumentBackend::connect(config).await?))
        }
    }

    async fn close(&self) {
        match self {
            Self::Sql(b) => b.close().await,
            Self::Document(b) => b.close().await,
        }
    }

    async fn ping(&self) -> DbResult<()> {
        match self {
            Self::Sql(b) => b.ping().await,
            Self::Document(b) => b.ping().await,
        }
    }

    fn pool_state(&self) -> PoolState {
        match self {
            Self::Sql(b) => b.pool_state(),
            Self::Document(b) => b.pool_state(),
        }
    }
}

/// Native driver handle, for operations the contract does not cover.
#[derive(Debug, Clone)]
pub enum NativeHandle {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
    Document {
        client: mongodb::Client,
        database: mongodb::Database,
    },
}

struct AdapterShared {
    name: String,
    config: ConnectionConfig,
    backend: RwLock<Option<Backend>>,
    logger: RwLock<Option<Arc<dyn QueryLogger>>>,
    retry: RetryPolicy,
}

/// Handle to one configured database.
#[derive(Clone)]
pub struct Adapter {
    shared: Arc<AdapterShared>,
    transaction: Option<Arc<TransactionContext>>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.shared.name)
            .field("backend", &self.shared.config.db_type)
            .field("connected", &self.is_connected())
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .finish()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run a document backend call on the bound session, or on the pool with the
/// unbound retry policy.
macro_rules! document_call {
    ($self:expr, $operation:expr, |$session:ident| $call:expr) => {
        match &$self.transaction {
            Some(tx) => {
                let mut inner = tx.lock().await;
                let session: &mut ClientSession = inner
                    .active(tx.id())?
                    .session()
                    .ok_or_else(|| DbError::internal("transaction is not a document session"))?;
                let $session = Some(session);
                $call.await
            }
            None => {
                $self
                    .retry_unbound($operation, || {
                        let $session: Option<&mut ClientSession> = None;
                        $call
                    })
                    .await
            }
        }
    };
}

impl Adapter {
    /// Create an adapter without connecting.
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Self {
        let retry = RetryPolicy::from_options(&config.pool);
        Self {
            shared: Arc::new(AdapterShared {
                name: name.into(),
                config,
                backend: RwLock::new(None),
                logger: RwLock::new(None),
                retry,
            }),
            transaction: None,
        }
    }

    /// Create and connect an adapter named "default".
    pub async fn open(config: ConnectionConfig) -> DbResult<Self> {
        let adapter = Self::new(crate::manager::DEFAULT_CONNECTION, config);
        adapter.connect().await?;
        Ok(adapter)
    }

    /// Establish the pool or client, retrying transient failures.
    pub async fn connect(&self) -> DbResult<()> {
        let config = &self.shared.config;
        config.validate()?;
        if self.is_connected() {
            return Err(DbError::connection(
                "already connected",
                "Call close() before connecting again",
            ));
        }

        let backend = self
            .shared
            .retry
            .run("connect", || Backend::connect(config))
            .await?;

        // A concurrent connect may have won while this one was in flight.
        let rejected = {
            let mut slot = write_lock(&self.shared.backend);
            if slot.is_some() {
                Some(backend)
            } else {
                *slot = Some(backend);
                None
            }
        };
        if let Some(backend) = rejected {
            backend.close().await;
            return Err(DbError::connection(
                "already connected",
                "Call close() before connecting again",
            ));
        }
        info!(
            connection = %self.shared.name,
            backend = %config.db_type,
            url = %config.masked_connection_string(),
            "Adapter connected"
        );
        Ok(())
    }

    /// Drain the pool or client. Every clone then reports "not connected".
    pub async fn close(&self) {
        let backend = write_lock(&self.shared.backend).take();
        if let Some(backend) = backend {
            backend.close().await;
            info!(connection = %self.shared.name, "Adapter closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        read_lock(&self.shared.backend).is_some()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn backend(&self) -> DatabaseType {
        self.shared.config.db_type
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The transaction this handle is bound to, if any.
    pub fn transaction_context(&self) -> Option<&Arc<TransactionContext>> {
        self.transaction.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn current(&self) -> DbResult<Backend> {
        read_lock(&self.shared.backend)
            .clone()
            .ok_or_else(DbError::not_connected)
    }

    pub fn set_query_logger(&self, logger: Arc<dyn QueryLogger>) {
        *write_lock(&self.shared.logger) = Some(logger);
    }

    pub fn clear_query_logger(&self) {
        *write_lock(&self.shared.logger) = None;
    }

    pub fn query_logger(&self) -> Option<Arc<dyn QueryLogger>> {
        read_lock(&self.shared.logger).clone()
    }

    /// Pool occupancy; all zeros when closed.
    pub fn pool_status(&self) -> PoolState {
        read_lock(&self.shared.backend)
            .as_ref()
            .map(Backend::pool_state)
            .unwrap_or_default()
    }

    /// Ping the backend. Never fails; errors are reported in the result.
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = match self.current() {
            Ok(backend) => backend.ping().await,
            Err(e) => Err(e),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => HealthCheckResult {
                healthy: true,
                latency_ms,
                error: None,
            },
            Err(e) => {
                warn!(connection = %self.shared.name, error = %e, "Health check failed");
                HealthCheckResult {
                    healthy: false,
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// The native pool or client, or `None` when closed.
    pub fn database(&self) -> Option<NativeHandle> {
        read_lock(&self.shared.backend)
            .as_ref()
            .map(|backend| match backend {
                Backend::Sql(b) => match b.pool().inner() {
                    DbPool::MySql(pool) => NativeHandle::MySql(pool.clone()),
                    DbPool::Postgres(pool) => NativeHandle::Postgres(pool.clone()),
                    DbPool::SQLite(pool) => NativeHandle::SQLite(pool.clone()),
                },
                Backend::Document(b) => NativeHandle::Document {
                    client: b.client().clone(),
                    database: b.database().clone(),
                },
            })
    }

    /// Timezone configured for date output.
    pub fn timezone(&self) -> Option<String> {
        self.shared.config.options.timezone.clone()
    }

    fn record<T>(&self, operation: &str, target: &str, started: Instant, result: &DbResult<T>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let in_transaction = self.transaction.is_some();
        match result {
            Ok(_) => debug!(
                connection = %self.shared.name,
                operation,
                target,
                duration_ms,
                in_transaction,
                "Operation succeeded"
            ),
            Err(e) => warn!(
                connection = %self.shared.name,
                operation,
                target,
                duration_ms,
                in_transaction,
                error = %e,
                "Operation failed"
            ),
        }

        if let Some(logger) = self.query_logger() {
            logger.log(&QueryLogEntry {
                connection: self.shared.name.clone(),
                backend: self.backend(),
                operation: operation.to_string(),
                target: target.to_string(),
                duration_ms,
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                in_transaction,
            });
        }
    }

    /// Retry pool-level operations when configured. Transactions never retry.
    async fn retry_unbound<T, F, Fut>(&self, operation: &str, mut f: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if self.transaction.is_none() && self.shared.config.pool.retry_transient_or_default() {
            self.shared.retry.run(operation, f).await
        } else {
            f().await
        }
    }

    fn check_writable(&self) -> DbResult<()> {
        if self.shared.config.options.read_only_or_default() {
            return Err(DbError::invalid_input(format!(
                "Connection '{}' is read-only",
                self.shared.name
            )));
        }
        Ok(())
    }

    async fn sql_fetch(
        &self,
        backend: &SqlBackend,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Record>> {
        match &self.transaction {
            Some(tx) => {
                let mut inner = tx.lock().await;
                let mut conn = inner
                    .active(tx.id())?
                    .sql_connection()
                    .ok_or_else(|| DbError::internal("transaction is not a SQL transaction"))?;
                conn.fetch(sql, params, backend.query_timeout()).await
            }
            None => {
                self.retry_unbound("query", || backend.query(sql, params))
                    .await
            }
        }
    }

    async fn sql_execute(
        &self,
        backend: &SqlBackend,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecuteResult> {
        match &self.transaction {
            Some(tx) => {
                let mut inner = tx.lock().await;
                let mut conn = inner
                    .active(tx.id())?
                    .sql_connection()
                    .ok_or_else(|| DbError::internal("transaction is not a SQL transaction"))?;
                conn.execute(sql, params, backend.query_timeout()).await
            }
            None => {
                self.retry_unbound("execute", || backend.execute(sql, params))
                    .await
            }
        }
    }

    /// Run a read-only request.
    pub async fn query(&self, request: QueryRequest) -> DbResult<Vec<Record>> {
        let started = Instant::now();
        let result = self.run_query(&request).await;
        self.record("query", request.target(), started, &result);
        result
    }

    async fn run_query(&self, request: &QueryRequest) -> DbResult<Vec<Record>> {
        match (self.current()?, request) {
            (Backend::Sql(b), QueryRequest::Sql { sql, params }) => {
                self.sql_fetch(&b, sql, params).await
            }
            (
                Backend::Document(b),
                QueryRequest::Find {
                    collection,
                    filter,
                    options,
                },
            ) => {
                document_call!(self, "find", |session| b.find(
                    session, collection, filter, options
                ))
            }
            (backend, _) => Err(mismatch(&backend)),
        }
    }

    /// Run a write request.
    pub async fn execute(&self, request: ExecuteRequest) -> DbResult<ExecuteResult> {
        let started = Instant::now();
        let result = self.run_execute(&request).await;
        self.record(request.operation(), request.target(), started, &result);
        result
    }

    async fn run_execute(&self, request: &ExecuteRequest) -> DbResult<ExecuteResult> {
        self.check_writable()?;
        match (self.current()?, request) {
            (Backend::Sql(b), ExecuteRequest::Sql { sql, params }) => {
                self.sql_execute(&b, sql, params).await
            }
            (
                Backend::Document(b),
                ExecuteRequest::Document {
                    op,
                    collection,
                    data,
                },
            ) => {
                document_call!(self, op.as_str(), |session| b.execute(
                    session, *op, collection, data
                ))
            }
            (backend, _) => Err(mismatch(&backend)),
        }
    }

    /// Count documents matching `filter`.
    pub async fn count(&self, collection: &str, filter: &Record) -> DbResult<u64> {
        let started = Instant::now();
        let result = self.run_count(collection, filter).await;
        self.record("count", collection, started, &result);
        result
    }

    async fn run_count(&self, collection: &str, filter: &Record) -> DbResult<u64> {
        let b = self.document_backend()?;
        document_call!(self, "count", |session| b.count(session, collection, filter))
    }

    /// Distinct values of `field` among documents matching `filter`.
    pub async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Record,
    ) -> DbResult<Vec<JsonValue>> {
        let started = Instant::now();
        let result = self.run_distinct(collection, field, filter).await;
        self.record("distinct", collection, started, &result);
        result
    }

    async fn run_distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Record,
    ) -> DbResult<Vec<JsonValue>> {
        let b = self.document_backend()?;
        document_call!(self, "distinct", |session| b.distinct(
            session, collection, field, filter
        ))
    }

    /// Run an aggregation pipeline.
    pub async fn aggregate(&self, collection: &str, pipeline: &[Record]) -> DbResult<Vec<Record>> {
        let started = Instant::now();
        let result = self.run_aggregate(collection, pipeline).await;
        self.record("aggregate", collection, started, &result);
        result
    }

    async fn run_aggregate(&self, collection: &str, pipeline: &[Record]) -> DbResult<Vec<Record>> {
        let b = self.document_backend()?;
        document_call!(self, "aggregate", |session| b.aggregate(
            session, collection, pipeline
        ))
    }

    fn document_backend(&self) -> DbResult<DocumentBackend> {
        match self.current()? {
            Backend::Document(b) => Ok(b),
            backend => Err(mismatch(&backend)),
        }
    }

    pub async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        let started = Instant::now();
        let result = self.run_create_index(spec).await;
        self.record("createIndex", &spec.table, started, &result);
        result
    }

    async fn run_create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        self.check_writable()?;
        match self.current()? {
            Backend::Sql(b) => {
                let sql = create_index_sql(b.dialect(), spec)?;
                self.sql_execute(&b, &sql, &[]).await.map(|_| ())
            }
            Backend::Document(b) => b.create_index(spec).await,
        }
    }

    pub async fn drop_index(&self, table: &str, name: &str) -> DbResult<()> {
        let started = Instant::now();
        let result = self.run_drop_index(table, name).await;
        self.record("dropIndex", table, started, &result);
        result
    }

    async fn run_drop_index(&self, table: &str, name: &str) -> DbResult<()> {
        self.check_writable()?;
        match self.current()? {
            Backend::Sql(b) => {
                let sql = drop_index_sql(b.dialect(), table, name)?;
                self.sql_execute(&b, &sql, &[]).await.map(|_| ())
            }
            Backend::Document(b) => b.drop_index(table, name).await,
        }
    }

    /// Open a transaction and return a handle bound to it.
    pub async fn begin(&self) -> DbResult<Adapter> {
        if let Some(tx) = &self.transaction {
            return Err(DbError::transaction(
                "a transaction is already open on this handle",
                Some(tx.id()),
            ));
        }
        let tx = match self.current()? {
            Backend::Sql(b) => b.pool().begin().await?,
            Backend::Document(b) => b.begin().await?,
        };
        Ok(Adapter {
            shared: Arc::clone(&self.shared),
            transaction: Some(Arc::new(TransactionContext::new(tx))),
        })
    }

    fn bound(&self) -> DbResult<&Arc<TransactionContext>> {
        self.transaction
            .as_ref()
            .ok_or_else(|| DbError::transaction("no transaction is open on this handle", None))
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.bound()?.commit().await
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.bound()?.rollback().await
    }

    /// State of the bound transaction; `Idle` for an unbound handle.
    pub async fn transaction_state(&self) -> TransactionState {
        match &self.transaction {
            Some(tx) => tx.state().await,
            None => TransactionState::Idle,
        }
    }

    fn savepoint_target(&self) -> DbResult<&Arc<TransactionContext>> {
        let backend = self.backend();
        if !backend.supports_savepoints() {
            return Err(DbError::savepoint_unsupported(backend));
        }
        self.bound()
    }

    pub async fn create_savepoint(&self, name: &str) -> DbResult<()> {
        self.savepoint_target()?.create_savepoint(name).await
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        self.savepoint_target()?.rollback_to_savepoint(name).await
    }

    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        self.savepoint_target()?.release_savepoint(name).await
    }

    /// Run `callback` inside a transaction.
    ///
    /// The callback receives a bound handle. `Ok` commits, `Err` rolls back
    /// and returns the callback's error unchanged. Called on a bound handle,
    /// SQL backends nest through a savepoint while the document backend joins
    /// the outer session.
    pub async fn transaction<F, Fut, T, E>(&self, callback: F) -> Result<T, E>
    where
        F: FnOnce(Adapter) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if let Some(tx) = &self.transaction {
            if !tx.backend().supports_savepoints() {
                return callback(self.clone()).await;
            }
            let savepoint = tx.next_savepoint_name();
            tx.create_savepoint(&savepoint).await?;
            return match callback(self.clone()).await {
                Ok(value) => {
                    tx.release_savepoint(&savepoint).await?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback_to_savepoint(&savepoint).await {
                        warn!(
                            transaction_id = %tx.id(),
                            savepoint = %savepoint,
                            error = %rollback_err,
                            "Failed to roll back nested transaction"
                        );
                    }
                    Err(e)
                }
            };
        }

        let bound = self.begin().await?;
        let Some(tx) = bound.transaction.clone() else {
            return Err(DbError::internal("begin returned an unbound handle").into());
        };
        match callback(bound).await {
            Ok(value) => {
                if tx.state().await.is_open() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.state().await.is_open() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(
                            transaction_id = %tx.id(),
                            error = %rollback_err,
                            "Rollback after failed callback did not complete"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

fn mismatch(backend: &Backend) -> DbError {
    match backend {
        Backend::Sql(_) => DbError::invalid_input("SQL backends accept only SQL requests"),
        Backend::Document(_) => {
            DbError::invalid_input("The document backend accepts only document requests")
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::QueryLogEntry;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingLogger(Mutex<Vec<QueryLogEntry>>);

    impl QueryLogger for CollectingLogger {
        fn log(&self, entry: &QueryLogEntry) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    fn mongo_adapter() -> Adapter {
        Adapter::new(
            "docs",
            ConnectionConfig::from_url("mongodb://localhost:27017/app").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unconnected_adapter_reports_not_connected() {
        let adapter = Adapter::new("main", ConnectionConfig::sqlite(":memory:"));
        assert!(!adapter.is_connected());
        assert!(adapter.database().is_none());
        assert_eq!(adapter.pool_status(), PoolState::default());

        let err = adapter
            .query(QueryRequest::sql("SELECT 1", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), DbError::not_connected().to_string());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_health_check_never_fails() {
        let adapter = Adapter::new("main", ConnectionConfig::sqlite(":memory:"));
        let health = adapter.health_check().await;
        assert!(!health.healthy);
        assert!(health.error.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_logger_receives_one_entry_per_operation() {
        let adapter = Adapter::new("main", ConnectionConfig::sqlite(":memory:"));
        let logger = Arc::new(CollectingLogger::default());
        adapter.set_query_logger(logger.clone());

        let _ = adapter.query(QueryRequest::sql("SELECT 1", vec![])).await;
        let _ = adapter
            .execute(ExecuteRequest::sql("DELETE FROM t", vec![]))
            .await;

        let entries = logger.0.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "query");
        assert_eq!(entries[0].target, "SELECT 1");
        assert!(!entries[0].success);
        assert_eq!(entries[1].operation, "execute");
        assert!(!entries[1].in_transaction);
    }

    #[tokio::test]
    async fn test_savepoints_require_bound_handle() {
        let adapter = Adapter::new("main", ConnectionConfig::sqlite(":memory:"));
        let err = adapter.create_savepoint("sp1").await.unwrap_err();
        assert!(matches!(err, DbError::Transaction { .. }));
        assert!(adapter.commit().await.is_err());
        assert_eq!(adapter.transaction_state().await, TransactionState::Idle);
    }

    #[tokio::test]
    async fn test_document_backend_rejects_savepoints() {
        let adapter = mongo_adapter();
        for result in [
            adapter.create_savepoint("sp1").await,
            adapter.rollback_to_savepoint("sp1").await,
            adapter.release_savepoint("sp1").await,
        ] {
            assert!(matches!(
                result,
                Err(DbError::SavepointUnsupported {
                    backend: DatabaseType::MongoDB
                })
            ));
        }
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let mut config = ConnectionConfig::sqlite(":memory:");
        config.options.read_only = Some(true);
        let adapter = Adapter::new("ro", config);
        let err = adapter
            .execute(ExecuteRequest::sql("DELETE FROM t", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_timezone_comes_from_config() {
        let mut config = ConnectionConfig::sqlite(":memory:");
        config.options.timezone = Some("Asia/Shanghai".into());
        let adapter = Adapter::new("tz", config);
        assert_eq!(adapter.timezone().as_deref(), Some("Asia/Shanghai"));
        assert_eq!(mongo_adapter().timezone(), None);
    }
}
