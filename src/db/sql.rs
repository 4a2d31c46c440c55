//! Statement execution for the SQL backends.
//!
//! The executor uses database-specific implementations organized in submodules
//! (`mysql`, `postgres`, `sqlite`). Each works on a borrowed native connection,
//! so the same code serves pooled connections and reserved transaction
//! connections.

use crate::config::{ConnectionConfig, DatabaseType};
use crate::db::params::{mysql_query, postgres_query, sqlite_query};
use crate::db::pool::{PoolState, PooledConnection, SqlPool};
use crate::db::types::RowToRecord;
use crate::db::value::{ExecuteResult, IndexSpec, QueryParam, Record};
use crate::error::{DbError, DbResult};
use crate::query::sql::{SqlDialect, quote_identifier};
use sqlx::{MySqlConnection, PgConnection, SqliteConnection};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// A borrowed native SQL connection.
pub(crate) enum SqlConnection<'c> {
    MySql(&'c mut MySqlConnection),
    Postgres(&'c mut PgConnection),
    SQLite(&'c mut SqliteConnection),
}

impl PooledConnection {
    pub(crate) fn as_sql_connection(&mut self) -> SqlConnection<'_> {
        match self {
            PooledConnection::MySql(c) => SqlConnection::MySql(&mut **c),
            PooledConnection::Postgres(c) => SqlConnection::Postgres(&mut **c),
            PooledConnection::SQLite(c) => SqlConnection::SQLite(&mut **c),
        }
    }
}

impl SqlConnection<'_> {
    /// Run a statement and decode every returned row.
    pub(crate) async fn fetch(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        debug!(sql = %sql, params = params.len(), "Executing query");
        let result = match self {
            SqlConnection::MySql(conn) => mysql::fetch(conn, sql, params, query_timeout).await,
            SqlConnection::Postgres(conn) => {
                postgres::fetch(conn, sql, params, query_timeout).await
            }
            SqlConnection::SQLite(conn) => sqlite::fetch(conn, sql, params, query_timeout).await,
        };
        result.map_err(DbError::into_query_error)
    }

    /// Run a write statement.
    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<ExecuteResult> {
        debug!(sql = %sql, params = params.len(), "Executing write operation");
        match self {
            SqlConnection::MySql(conn) => mysql::execute(conn, sql, params, query_timeout).await,
            SqlConnection::Postgres(conn) => {
                postgres::execute(conn, sql, params, query_timeout).await
            }
            SqlConnection::SQLite(conn) => {
                sqlite::execute(conn, sql, params, query_timeout).await
            }
        }
    }

    /// Run a parameterless statement over the text protocol.
    /// Used for SAVEPOINT handling, which some servers refuse to prepare.
    pub(crate) async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        use sqlx::Executor;
        match self {
            SqlConnection::MySql(conn) => {
                (&mut **conn).execute(sql).await?;
            }
            SqlConnection::Postgres(conn) => {
                (&mut **conn).execute(sql).await?;
            }
            SqlConnection::SQLite(conn) => {
                (&mut **conn).execute(sql).await?;
            }
        }
        Ok(())
    }
}

fn timeout_error(operation: &str, duration: Duration) -> DbError {
    DbError::timeout(operation, duration.as_millis() as u64)
}

fn is_insert(sql: &str) -> bool {
    let head = sql.trim_start().get(..7).unwrap_or_default();
    head.eq_ignore_ascii_case("insert ") || head.eq_ignore_ascii_case("replace")
}

fn has_returning(sql: &str) -> bool {
    sql.to_ascii_uppercase().contains(" RETURNING ")
}

mod mysql {
    use super::*;

    pub async fn fetch(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        // When params is empty, use raw SQL to avoid prepared statement issues
        let rows = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).fetch_all(sql).await
            } else {
                mysql_query(sql, params).fetch_all(&mut *conn).await
            }
        };

        match timeout(query_timeout, rows).await {
            Ok(Ok(rows)) => Ok(rows.iter().map(|r| r.to_record()).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<ExecuteResult> {
        let result = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).execute(sql).await
            } else {
                mysql_query(sql, params).execute(&mut *conn).await
            }
        };

        match timeout(query_timeout, result).await {
            Ok(Ok(r)) => Ok(ExecuteResult {
                affected_rows: r.rows_affected(),
                insert_id: (is_insert(sql) && r.last_insert_id() > 0)
                    .then(|| r.last_insert_id().into()),
                ..ExecuteResult::default()
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;

    pub async fn fetch(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        let rows = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).fetch_all(sql).await
            } else {
                postgres_query(sql, params).fetch_all(&mut *conn).await
            }
        };

        match timeout(query_timeout, rows).await {
            Ok(Ok(rows)) => Ok(rows.iter().map(|r| r.to_record()).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    /// PostgreSQL has no last-insert-id; statements with RETURNING report the
    /// first column of the first returned row instead.
    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<ExecuteResult> {
        if has_returning(sql) {
            let rows = fetch(conn, sql, params, query_timeout).await?;
            return Ok(ExecuteResult {
                affected_rows: rows.len() as u64,
                insert_id: rows
                    .first()
                    .and_then(|row| row.values().next().cloned())
                    .filter(|v| !v.is_null()),
                ..ExecuteResult::default()
            });
        }

        let result = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).execute(sql).await
            } else {
                postgres_query(sql, params).execute(&mut *conn).await
            }
        };

        match timeout(query_timeout, result).await {
            Ok(Ok(r)) => Ok(ExecuteResult {
                affected_rows: r.rows_affected(),
                ..ExecuteResult::default()
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;

    pub async fn fetch(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        let rows = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).fetch_all(sql).await
            } else {
                sqlite_query(sql, params).fetch_all(&mut *conn).await
            }
        };

        match timeout(query_timeout, rows).await {
            Ok(Ok(rows)) => Ok(rows.iter().map(|r| r.to_record()).collect()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<ExecuteResult> {
        let result = async {
            if params.is_empty() {
                use sqlx::Executor;
                (&mut *conn).execute(sql).await
            } else {
                sqlite_query(sql, params).execute(&mut *conn).await
            }
        };

        match timeout(query_timeout, result).await {
            Ok(Ok(r)) => Ok(ExecuteResult {
                affected_rows: r.rows_affected(),
                insert_id: (is_insert(sql) && r.rows_affected() > 0)
                    .then(|| r.last_insert_rowid().into()),
                ..ExecuteResult::default()
            }),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

/// Pool-backed SQL backend.
#[derive(Debug, Clone)]
pub struct SqlBackend {
    pool: SqlPool,
    query_timeout: Duration,
}

impl SqlBackend {
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        Ok(Self {
            pool: SqlPool::connect(config).await?,
            query_timeout: config.options.query_timeout_or_default(),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn dialect(&self) -> SqlDialect {
        SqlDialect::from(self.db_type())
    }

    pub fn pool(&self) -> &SqlPool {
        &self.pool
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;
        conn.as_sql_connection()
            .fetch(sql, params, self.query_timeout)
            .await
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecuteResult> {
        let mut conn = self.pool.acquire().await?;
        conn.as_sql_connection()
            .execute(sql, params, self.query_timeout)
            .await
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// `CREATE [UNIQUE] INDEX` statement for the dialect.
pub(crate) fn create_index_sql(dialect: SqlDialect, spec: &IndexSpec) -> DbResult<String> {
    if spec.fields.is_empty() {
        return Err(DbError::invalid_input(format!(
            "Index '{}' must name at least one field",
            spec.name
        )));
    }
    let columns = spec
        .fields
        .iter()
        .map(|(field, order)| Ok(format!("{} {}", quote_identifier(dialect, field)?, order.as_sql())))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(format!(
        "CREATE {}INDEX {} ON {} ({})",
        if spec.unique { "UNIQUE " } else { "" },
        quote_identifier(dialect, &spec.name)?,
        quote_identifier(dialect, &spec.table)?,
        columns.join(", ")
    ))
}

/// `DROP INDEX` statement for the dialect. MySQL scopes index names per table.
pub(crate) fn drop_index_sql(dialect: SqlDialect, table: &str, name: &str) -> DbResult<String> {
    let name = quote_identifier(dialect, name)?;
    Ok(match dialect {
        SqlDialect::MySql => format!("DROP INDEX {} ON {}", name, quote_identifier(dialect, table)?),
        _ => format!("DROP INDEX IF EXISTS {}", name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::SortOrder;

    #[test]
    fn test_is_insert() {
        assert!(is_insert("INSERT INTO t VALUES (1)"));
        assert!(is_insert("  insert into t values (1)"));
        assert!(is_insert("REPLACE INTO t VALUES (1)"));
        assert!(!is_insert("UPDATE t SET a = 1"));
        assert!(!is_insert("ins"));
    }

    #[test]
    fn test_has_returning() {
        assert!(has_returning("INSERT INTO t (a) VALUES ($1) RETURNING \"id\""));
        assert!(!has_returning("INSERT INTO t (a) VALUES ($1)"));
    }

    #[test]
    fn test_create_index_sql() {
        let spec = IndexSpec::new("users", "idx_users_email")
            .field("email", SortOrder::Asc)
            .unique();
        assert_eq!(
            create_index_sql(SqlDialect::Postgres, &spec).unwrap(),
            "CREATE UNIQUE INDEX \"idx_users_email\" ON \"users\" (\"email\" ASC)"
        );

        let spec = IndexSpec::new("orders", "idx_orders")
            .field("user_id", SortOrder::Asc)
            .field("created_at", SortOrder::Desc);
        assert_eq!(
            create_index_sql(SqlDialect::MySql, &spec).unwrap(),
            "CREATE INDEX `idx_orders` ON `orders` (`user_id` ASC, `created_at` DESC)"
        );
    }

    #[test]
    fn test_create_index_requires_fields() {
        let spec = IndexSpec::new("users", "idx_empty");
        assert!(create_index_sql(SqlDialect::Sqlite, &spec).is_err());
    }

    #[test]
    fn test_drop_index_sql() {
        assert_eq!(
            drop_index_sql(SqlDialect::MySql, "users", "idx").unwrap(),
            "DROP INDEX `idx` ON `users`"
        );
        assert_eq!(
            drop_index_sql(SqlDialect::Sqlite, "users", "idx").unwrap(),
            "DROP INDEX IF EXISTS \"idx\""
        );
    }
}
