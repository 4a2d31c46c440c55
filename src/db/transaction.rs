//! Transaction state machine.
//!
//! A `TransactionContext` exclusively owns one reserved connection (SQL) or
//! session (MongoDB) from BEGIN until COMMIT/ROLLBACK. Every statement issued
//! through it is serialized by an async mutex, so operations on one
//! transaction execute in issuance order.
//!
//! SQL backends support a LIFO savepoint stack; the document backend runs a
//! single-level session and rejects savepoints.

use crate::config::DatabaseType;
use crate::db::sql::SqlConnection;
use crate::error::{DbError, DbResult};
use mongodb::ClientSession;
use serde::Serialize;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// No transaction has been opened on this handle.
    Idle,
    Open,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Native transaction handle. Must be committed or rolled back explicitly;
/// dropping an open SQL transaction rolls it back.
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
    Document(ClientSession),
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.backend()).finish()
    }
}

impl DbTransaction {
    pub fn backend(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
            Self::Document(_) => DatabaseType::MongoDB,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        match self {
            Self::MySql(tx) => tx.commit().await?,
            Self::Postgres(tx) => tx.commit().await?,
            Self::SQLite(tx) => tx.commit().await?,
            Self::Document(mut session) => session.commit_transaction().await?,
        }
        Ok(())
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        match self {
            Self::MySql(tx) => tx.rollback().await?,
            Self::Postgres(tx) => tx.rollback().await?,
            Self::SQLite(tx) => tx.rollback().await?,
            Self::Document(mut session) => session.abort_transaction().await?,
        }
        Ok(())
    }

    /// The reserved SQL connection, or `None` for a document session.
    pub(crate) fn sql_connection(&mut self) -> Option<SqlConnection<'_>> {
        match self {
            Self::MySql(tx) => Some(SqlConnection::MySql(&mut **tx)),
            Self::Postgres(tx) => Some(SqlConnection::Postgres(&mut **tx)),
            Self::SQLite(tx) => Some(SqlConnection::SQLite(&mut **tx)),
            Self::Document(_) => None,
        }
    }

    /// The session, or `None` for a SQL transaction.
    pub(crate) fn session(&mut self) -> Option<&mut ClientSession> {
        match self {
            Self::Document(session) => Some(session),
            _ => None,
        }
    }
}

/// Validate a savepoint name. Names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 64 {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{}': use letters, digits and underscores",
            name
        )))
    }
}

/// LIFO stack of savepoint names.
///
/// Duplicate names are allowed; operations target the most recent one, as
/// native SQL does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavepointStack {
    names: Vec<String>,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>) {
        self.names.push(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().rposition(|n| n == name)
    }

    /// Pop `name` and everything pushed after it. Returns the popped names,
    /// most recent first.
    pub fn pop_through(&mut self, name: &str) -> Option<Vec<String>> {
        let pos = self.position(name)?;
        let mut popped = self.names.split_off(pos);
        popped.reverse();
        Some(popped)
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Mutable transaction state guarded by the context mutex.
#[derive(Debug)]
pub(crate) struct TxInner {
    transaction: Option<DbTransaction>,
    state: TransactionState,
    savepoints: SavepointStack,
}

impl TxInner {
    /// The native transaction, if it is still open.
    pub(crate) fn active(&mut self, id: &str) -> DbResult<&mut DbTransaction> {
        match (self.state, self.transaction.as_mut()) {
            (TransactionState::Open, Some(tx)) => Ok(tx),
            _ => Err(DbError::transaction(
                "transaction is no longer active",
                Some(id),
            )),
        }
    }
}

/// One open transaction, shared by every clone of a bound adapter handle.
#[derive(Debug)]
pub struct TransactionContext {
    id: String,
    backend: DatabaseType,
    inner: Mutex<TxInner>,
    savepoint_seq: AtomicU64,
}

impl TransactionContext {
    pub(crate) fn new(transaction: DbTransaction) -> Self {
        let id = format!("tx_{}", uuid::Uuid::new_v4().simple());
        let backend = transaction.backend();
        debug!(transaction_id = %id, backend = %backend, "Transaction opened");
        Self {
            id,
            backend,
            inner: Mutex::new(TxInner {
                transaction: Some(transaction),
                state: TransactionState::Open,
                savepoints: SavepointStack::new(),
            }),
            savepoint_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> DatabaseType {
        self.backend
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    /// Current savepoint names, oldest first.
    pub async fn savepoints(&self) -> Vec<String> {
        self.inner.lock().await.savepoints.names().to_vec()
    }

    /// Lock the transaction for one statement.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, TxInner> {
        self.inner.lock().await
    }

    /// Generate a unique savepoint name for nested transactions.
    pub(crate) fn next_savepoint_name(&self) -> String {
        format!("sp_{}", self.savepoint_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Discard savepoints and COMMIT. The connection returns to the pool.
    pub async fn commit(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active(&self.id)?;
        inner.savepoints.clear();
        let Some(tx) = inner.transaction.take() else {
            return Err(DbError::transaction("transaction is no longer active", Some(&self.id)));
        };

        match tx.commit().await {
            Ok(()) => {
                inner.state = TransactionState::Committed;
                info!(transaction_id = %self.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                // The native handle is consumed; the server discards the work.
                inner.state = TransactionState::RolledBack;
                warn!(transaction_id = %self.id, error = %e, "Commit failed");
                Err(DbError::transaction_caused_by("commit failed", Some(&self.id), e))
            }
        }
    }

    /// ROLLBACK the whole transaction. The connection returns to the pool.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        inner.active(&self.id)?;
        inner.savepoints.clear();
        let Some(tx) = inner.transaction.take() else {
            return Err(DbError::transaction("transaction is no longer active", Some(&self.id)));
        };
        inner.state = TransactionState::RolledBack;

        match tx.rollback().await {
            Ok(()) => {
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %self.id, error = %e, "Rollback failed");
                Err(DbError::transaction_caused_by("rollback failed", Some(&self.id), e))
            }
        }
    }

    /// Push a savepoint and issue `SAVEPOINT name`.
    pub async fn create_savepoint(&self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let mut inner = self.inner.lock().await;
        let tx = inner.active(&self.id)?;
        let Some(mut conn) = tx.sql_connection() else {
            return Err(DbError::savepoint_unsupported(self.backend));
        };
        conn.execute_raw(&format!("SAVEPOINT {}", name)).await?;
        drop(conn);
        inner.savepoints.push(name);
        debug!(transaction_id = %self.id, savepoint = name, "Savepoint created");
        Ok(())
    }

    /// Undo everything after `name`, popping it and every later savepoint.
    pub async fn rollback_to_savepoint(&self, name: &str) -> DbResult<()> {
        self.unwind_savepoint(name, "ROLLBACK TO SAVEPOINT").await
    }

    /// Forget `name` and every later savepoint, keeping their work.
    pub async fn release_savepoint(&self, name: &str) -> DbResult<()> {
        self.unwind_savepoint(name, "RELEASE SAVEPOINT").await
    }

    async fn unwind_savepoint(&self, name: &str, statement: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        let mut inner = self.inner.lock().await;
        inner.active(&self.id)?;
        if !self.backend.supports_savepoints() {
            return Err(DbError::savepoint_unsupported(self.backend));
        }
        if !inner.savepoints.contains(name) {
            return Err(DbError::transaction(
                format!("savepoint '{}' does not exist", name),
                Some(&self.id),
            ));
        }
        if let Some(mut conn) = inner.active(&self.id)?.sql_connection() {
            conn.execute_raw(&format!("{} {}", statement, name)).await?;
        }
        let popped = inner.savepoints.pop_through(name).unwrap_or_default();
        debug!(
            transaction_id = %self.id,
            savepoint = name,
            popped = popped.len(),
            "{}",
            statement
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_stack_pop_through() {
        let mut stack = SavepointStack::new();
        stack.push("a");
        stack.push("b");
        stack.push("c");

        let popped = stack.pop_through("b").unwrap();
        assert_eq!(popped, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(stack.names(), &["a".to_string()]);
    }

    #[test]
    fn test_savepoint_stack_unknown_name() {
        let mut stack = SavepointStack::new();
        stack.push("a");
        assert!(stack.pop_through("zzz").is_none());
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_savepoint_stack_duplicate_targets_latest() {
        let mut stack = SavepointStack::new();
        stack.push("s");
        stack.push("t");
        stack.push("s");
        let popped = stack.pop_through("s").unwrap();
        assert_eq!(popped, vec!["s".to_string()]);
        assert_eq!(stack.names(), &["s".to_string(), "t".to_string()]);
    }

    #[test]
    fn test_savepoint_stack_clear() {
        let mut stack = SavepointStack::new();
        stack.push("a");
        stack.clear();
        assert!(stack.is_empty());
        assert!(!stack.contains("a"));
    }

    #[test]
    fn test_validate_savepoint_name() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_x").is_ok());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1abc").is_err());
        assert!(validate_savepoint_name("a; DROP TABLE users").is_err());
        assert!(validate_savepoint_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Open.is_open());
        assert!(!TransactionState::Idle.is_ended());
        assert!(TransactionState::Committed.is_ended());
        assert!(TransactionState::RolledBack.is_ended());
    }
}
