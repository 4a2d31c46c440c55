//! Fluent SQL text builder.
//!
//! Conditions are written with `?` placeholders. PostgreSQL output is
//! renumbered to `$1..$n` in render order, and `get_params()` returns values
//! in that same order: SET/VALUES first, then WHERE.

use crate::config::DatabaseType;
use crate::db::adapter::Adapter;
use crate::db::value::{ExecuteRequest, ExecuteResult, QueryParam, QueryRequest, Record, SortOrder};
use crate::error::{DbError, DbResult};

/// SQL flavour used for quoting, placeholders and LIMIT/OFFSET rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Postgres,
    Sqlite,
}

impl From<DatabaseType> for SqlDialect {
    fn from(db: DatabaseType) -> Self {
        match db {
            DatabaseType::MySQL => Self::MySql,
            DatabaseType::PostgreSQL => Self::Postgres,
            // MongoDB never renders SQL; ANSI quoting applies if asked.
            DatabaseType::SQLite | DatabaseType::MongoDB => Self::Sqlite,
        }
    }
}

impl SqlDialect {
    fn quote_char(self) -> char {
        match self {
            Self::MySql => '`',
            _ => '"',
        }
    }
}

/// Check one identifier segment: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Quote a possibly qualified identifier (`table.column`, `t.*`).
pub fn quote_identifier(dialect: SqlDialect, ident: &str) -> DbResult<String> {
    let q = dialect.quote_char();
    let parts: Vec<&str> = ident.split('.').collect();
    let last = parts.len() - 1;
    let mut quoted = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        if i == last && *part == "*" && last > 0 {
            quoted.push("*".to_string());
        } else if is_identifier(part) {
            quoted.push(format!("{q}{part}{q}"));
        } else {
            return Err(DbError::invalid_input(format!(
                "Invalid identifier: '{}'",
                ident
            )));
        }
    }
    Ok(quoted.join("."))
}

/// Plain identifiers are quoted; expressions (`COUNT(*) AS n`) pass through.
fn render_column(dialect: SqlDialect, column: &str) -> String {
    match quote_identifier(dialect, column) {
        Ok(quoted) => quoted,
        Err(_) => column.to_string(),
    }
}

/// Rewrite `?` placeholders to `$1..$n`, skipping quoted literals.
///
/// The Postgres JSON operators `?|` and `?&` are left alone. A bare `?`
/// is always a placeholder, so the key-exists operator must be written
/// as `jsonb_exists(col, key)` in builder conditions.
pub fn renumber_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '?') if matches!(chars.peek(), Some('|' | '&')) => out.push(c),
            (None, '?') => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            (None, c) => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connector {
    And,
    Or,
}

#[derive(Debug, Clone)]
struct Condition {
    connector: Connector,
    sql: String,
    params: Vec<QueryParam>,
}

#[derive(Debug, Clone, Copy)]
enum JoinKind {
    Inner,
    Left,
    Right,
}

#[derive(Debug, Clone)]
struct Join {
    kind: JoinKind,
    table: String,
    on: String,
}

#[derive(Debug, Clone, Default)]
enum Statement {
    #[default]
    Select,
    Insert {
        table: String,
        values: Vec<(String, QueryParam)>,
    },
    Update {
        table: String,
        values: Vec<(String, QueryParam)>,
    },
    Delete {
        table: String,
    },
}

/// Fluent SQL builder, optionally bound to an adapter for execution.
#[derive(Debug, Clone)]
pub struct SqlQueryBuilder {
    adapter: Option<Adapter>,
    dialect: SqlDialect,
    statement: Statement,
    select: Vec<String>,
    from: Option<String>,
    joins: Vec<Join>,
    conditions: Vec<Condition>,
    raw_sets: Vec<(String, Vec<QueryParam>)>,
    order: Vec<(String, SortOrder)>,
    limit: Option<u64>,
    offset: Option<u64>,
    returning: Option<String>,
}

impl SqlQueryBuilder {
    /// An unbound builder; terminal calls fail with `InvalidInput`.
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            adapter: None,
            dialect,
            statement: Statement::Select,
            select: Vec::new(),
            from: None,
            joins: Vec::new(),
            conditions: Vec::new(),
            raw_sets: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            returning: None,
        }
    }

    /// A builder that renders for and executes on `adapter`.
    pub fn for_adapter(adapter: &Adapter) -> Self {
        Self {
            adapter: Some(adapter.clone()),
            ..Self::new(SqlDialect::from(adapter.backend()))
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.from = Some(table.into());
        self
    }

    /// Append an AND condition.
    pub fn where_(mut self, condition: impl Into<String>, params: Vec<QueryParam>) -> Self {
        self.conditions.push(Condition {
            connector: Connector::And,
            sql: condition.into(),
            params,
        });
        self
    }

    /// Append an OR condition at the top level.
    pub fn or_where(mut self, condition: impl Into<String>, params: Vec<QueryParam>) -> Self {
        self.conditions.push(Condition {
            connector: Connector::Or,
            sql: condition.into(),
            params,
        });
        self
    }

    fn push_join(mut self, kind: JoinKind, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.joins.push(Join {
            kind,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    pub fn join(self, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.push_join(JoinKind::Inner, table, on)
    }

    pub fn left_join(self, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.push_join(JoinKind::Left, table, on)
    }

    pub fn right_join(self, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.push_join(JoinKind::Right, table, on)
    }

    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// INSERT the fields of `record`.
    pub fn insert(self, table: impl Into<String>, record: &Record) -> Self {
        let values = record
            .iter()
            .map(|(k, v)| (k.clone(), QueryParam::from(v)))
            .collect();
        self.insert_values(table, values)
    }

    /// INSERT pre-converted values.
    pub fn insert_values(mut self, table: impl Into<String>, values: Vec<(String, QueryParam)>) -> Self {
        self.statement = Statement::Insert {
            table: table.into(),
            values,
        };
        self
    }

    /// UPDATE with the fields of `record` as SET assignments.
    pub fn update(self, table: impl Into<String>, record: &Record) -> Self {
        let values = record
            .iter()
            .map(|(k, v)| (k.clone(), QueryParam::from(v)))
            .collect();
        self.update_values(table, values)
    }

    pub fn update_values(mut self, table: impl Into<String>, values: Vec<(String, QueryParam)>) -> Self {
        self.statement = Statement::Update {
            table: table.into(),
            values,
        };
        self
    }

    /// Raw SET assignment, e.g. `set_raw("\"n\" = \"n\" + ?", vec![1.into()])`.
    pub fn set_raw(mut self, expression: impl Into<String>, params: Vec<QueryParam>) -> Self {
        if matches!(self.statement, Statement::Select) {
            if let Some(table) = self.from.clone() {
                self.statement = Statement::Update {
                    table,
                    values: Vec::new(),
                };
            }
        }
        self.raw_sets.push((expression.into(), params));
        self
    }

    pub fn delete(mut self, table: impl Into<String>) -> Self {
        self.statement = Statement::Delete {
            table: table.into(),
        };
        self
    }

    /// Column reported back by an INSERT on PostgreSQL.
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning = Some(column.into());
        self
    }

    fn quote(&self, ident: &str) -> DbResult<String> {
        quote_identifier(self.dialect, ident)
    }

    fn render_where(&self, sql: &mut String) {
        if self.conditions.is_empty() {
            return;
        }
        let wrap = self.conditions.len() > 1;
        sql.push_str(" WHERE ");
        for (i, cond) in self.conditions.iter().enumerate() {
            if i > 0 {
                sql.push_str(match cond.connector {
                    Connector::And => " AND ",
                    Connector::Or => " OR ",
                });
            }
            if wrap {
                sql.push('(');
                sql.push_str(&cond.sql);
                sql.push(')');
            } else {
                sql.push_str(&cond.sql);
            }
        }
    }

    fn render_limit(&self, sql: &mut String) {
        match (self.limit, self.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {}", limit));
                if let Some(offset) = offset {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, Some(offset)) => {
                match self.dialect {
                    SqlDialect::MySql => sql.push_str(" LIMIT 18446744073709551615"),
                    SqlDialect::Sqlite => sql.push_str(" LIMIT -1"),
                    SqlDialect::Postgres => {}
                }
                sql.push_str(&format!(" OFFSET {}", offset));
            }
            (None, None) => {}
        }
    }

    /// Render the statement.
    pub fn to_sql(&self) -> DbResult<String> {
        let mut sql = match &self.statement {
            Statement::Select => {
                let from = self
                    .from
                    .as_deref()
                    .ok_or_else(|| DbError::invalid_input("SELECT requires a FROM table"))?;
                let columns = if self.select.is_empty() {
                    "*".to_string()
                } else {
                    self.select
                        .iter()
                        .map(|c| render_column(self.dialect, c))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let mut sql = format!("SELECT {} FROM {}", columns, self.quote(from)?);
                for join in &self.joins {
                    let keyword = match join.kind {
                        JoinKind::Inner => "INNER JOIN",
                        JoinKind::Left => "LEFT JOIN",
                        JoinKind::Right => "RIGHT JOIN",
                    };
                    sql.push_str(&format!(
                        " {} {} ON {}",
                        keyword,
                        render_column(self.dialect, &join.table),
                        join.on
                    ));
                }
                self.render_where(&mut sql);
                if !self.order.is_empty() {
                    let terms = self
                        .order
                        .iter()
                        .map(|(col, dir)| format!("{} {}", render_column(self.dialect, col), dir.as_sql()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(" ORDER BY ");
                    sql.push_str(&terms);
                }
                self.render_limit(&mut sql);
                sql
            }
            Statement::Insert { table, values } => {
                if values.is_empty() {
                    return Err(DbError::invalid_input("INSERT requires at least one value"));
                }
                let columns = values
                    .iter()
                    .map(|(col, _)| self.quote(col))
                    .collect::<DbResult<Vec<_>>>()?;
                let placeholders = vec!["?"; values.len()].join(", ");
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.quote(table)?,
                    columns.join(", "),
                    placeholders
                );
                if let (SqlDialect::Postgres, Some(col)) = (self.dialect, &self.returning) {
                    sql.push_str(&format!(" RETURNING {}", self.quote(col)?));
                }
                sql
            }
            Statement::Update { table, values } => {
                let mut sets = values
                    .iter()
                    .map(|(col, _)| Ok(format!("{} = ?", self.quote(col)?)))
                    .collect::<DbResult<Vec<_>>>()?;
                sets.extend(self.raw_sets.iter().map(|(expr, _)| expr.clone()));
                if sets.is_empty() {
                    return Err(DbError::invalid_input("UPDATE requires at least one assignment"));
                }
                let mut sql = format!("UPDATE {} SET {}", self.quote(table)?, sets.join(", "));
                self.render_where(&mut sql);
                sql
            }
            Statement::Delete { table } => {
                let mut sql = format!("DELETE FROM {}", self.quote(table)?);
                self.render_where(&mut sql);
                sql
            }
        };

        if self.dialect == SqlDialect::Postgres {
            sql = renumber_placeholders(&sql);
        }
        Ok(sql)
    }

    /// Parameters in render order.
    pub fn get_params(&self) -> Vec<QueryParam> {
        let mut params = Vec::new();
        match &self.statement {
            Statement::Insert { values, .. } => {
                params.extend(values.iter().map(|(_, v)| v.clone()));
                return params;
            }
            Statement::Update { values, .. } => {
                params.extend(values.iter().map(|(_, v)| v.clone()));
                for (_, raw) in &self.raw_sets {
                    params.extend(raw.iter().cloned());
                }
            }
            Statement::Select | Statement::Delete { .. } => {}
        }
        for cond in &self.conditions {
            params.extend(cond.params.iter().cloned());
        }
        params
    }

    fn bound_adapter(&self) -> DbResult<&Adapter> {
        self.adapter
            .as_ref()
            .ok_or_else(|| DbError::invalid_input("Query builder is not bound to an adapter"))
    }

    /// Run as a read and return every row.
    pub async fn execute(&self) -> DbResult<Vec<Record>> {
        let adapter = self.bound_adapter()?;
        adapter
            .query(QueryRequest::sql(self.to_sql()?, self.get_params()))
            .await
    }

    /// First row, or `None` when the result is empty.
    pub async fn execute_one(&self) -> DbResult<Option<Record>> {
        Ok(self.execute().await?.into_iter().next())
    }

    /// Run as a write.
    pub async fn execute_update(&self) -> DbResult<ExecuteResult> {
        let adapter = self.bound_adapter()?;
        adapter
            .execute(ExecuteRequest::sql(self.to_sql()?, self.get_params()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier(SqlDialect::MySql, "users").unwrap(), "`users`");
        assert_eq!(
            quote_identifier(SqlDialect::Postgres, "u.name").unwrap(),
            "\"u\".\"name\""
        );
        assert_eq!(quote_identifier(SqlDialect::Sqlite, "u.*").unwrap(), "\"u\".*");
        assert!(quote_identifier(SqlDialect::Sqlite, "name; DROP TABLE x").is_err());
        assert!(quote_identifier(SqlDialect::Sqlite, "*").is_err());
        assert!(quote_identifier(SqlDialect::Sqlite, "1abc").is_err());
    }

    #[test]
    fn test_renumber_skips_literals() {
        assert_eq!(
            renumber_placeholders("a = ? AND b = '?' AND c = ?"),
            "a = $1 AND b = '?' AND c = $2"
        );
    }

    #[test]
    fn test_renumber_leaves_json_operators() {
        assert_eq!(
            renumber_placeholders("tags ?| ? AND attrs ?& ? AND id = ?"),
            "tags ?| $1 AND attrs ?& $2 AND id = $3"
        );
    }

    #[test]
    fn test_select_clause_order() {
        let qb = SqlQueryBuilder::new(SqlDialect::MySql)
            .select(["u.id", "u.name", "COUNT(o.id) AS orders"])
            .from("users")
            .left_join("orders o", "o.user_id = u.id")
            .join("teams", "teams.id = u.team_id")
            .where_("u.age > ?", vec![18.into()])
            .or_where("u.role = ?", vec!["admin".into()])
            .order_by("u.name", SortOrder::Asc)
            .order_by("u.id", SortOrder::Desc)
            .limit(10)
            .offset(20);
        assert_eq!(
            qb.to_sql().unwrap(),
            "SELECT `u`.`id`, `u`.`name`, COUNT(o.id) AS orders FROM `users` \
             LEFT JOIN orders o ON o.user_id = u.id \
             INNER JOIN `teams` ON teams.id = u.team_id \
             WHERE (u.age > ?) OR (u.role = ?) \
             ORDER BY `u`.`name` ASC, `u`.`id` DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(qb.get_params(), vec![QueryParam::Int(18), QueryParam::from("admin")]);
    }

    #[test]
    fn test_single_condition_is_not_wrapped() {
        let sql = SqlQueryBuilder::new(SqlDialect::Sqlite)
            .from("users")
            .where_("id = ?", vec![1.into()])
            .to_sql()
            .unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\" WHERE id = ?");
    }

    #[test]
    fn test_postgres_update_renumbers_set_then_where() {
        let record = json!({"name": "Ann", "age": 31});
        let qb = SqlQueryBuilder::new(SqlDialect::Postgres)
            .update("users", record.as_object().unwrap())
            .where_("id = ?", vec![7.into()]);
        assert_eq!(
            qb.to_sql().unwrap(),
            "UPDATE \"users\" SET \"name\" = $1, \"age\" = $2 WHERE id = $3"
        );
        assert_eq!(
            qb.get_params(),
            vec![QueryParam::from("Ann"), QueryParam::Int(31), QueryParam::Int(7)]
        );
    }

    #[test]
    fn test_set_raw_increment() {
        let qb = SqlQueryBuilder::new(SqlDialect::Sqlite)
            .update_values("counters", vec![])
            .set_raw("\"hits\" = \"hits\" + ?", vec![5.into()])
            .where_("id = ?", vec![1.into()]);
        assert_eq!(
            qb.to_sql().unwrap(),
            "UPDATE \"counters\" SET \"hits\" = \"hits\" + ? WHERE id = ?"
        );
        assert_eq!(qb.get_params(), vec![QueryParam::Int(5), QueryParam::Int(1)]);
    }

    #[test]
    fn test_insert_with_returning() {
        let record = json!({"name": "Ann"});
        let qb = SqlQueryBuilder::new(SqlDialect::Postgres)
            .insert("users", record.as_object().unwrap())
            .returning("id");
        assert_eq!(
            qb.to_sql().unwrap(),
            "INSERT INTO \"users\" (\"name\") VALUES ($1) RETURNING \"id\""
        );

        // RETURNING is PostgreSQL-only.
        let qb = SqlQueryBuilder::new(SqlDialect::MySql)
            .insert("users", record.as_object().unwrap())
            .returning("id");
        assert_eq!(qb.to_sql().unwrap(), "INSERT INTO `users` (`name`) VALUES (?)");
    }

    #[test]
    fn test_delete() {
        let sql = SqlQueryBuilder::new(SqlDialect::MySql)
            .delete("sessions")
            .where_("expires_at < ?", vec![1.into()])
            .to_sql()
            .unwrap();
        assert_eq!(sql, "DELETE FROM `sessions` WHERE expires_at < ?");
    }

    #[test]
    fn test_offset_without_limit() {
        let render = |dialect| {
            SqlQueryBuilder::new(dialect)
                .from("t")
                .offset(5)
                .to_sql()
                .unwrap()
        };
        assert_eq!(
            render(SqlDialect::MySql),
            "SELECT * FROM `t` LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(render(SqlDialect::Sqlite), "SELECT * FROM \"t\" LIMIT -1 OFFSET 5");
        assert_eq!(render(SqlDialect::Postgres), "SELECT * FROM \"t\" OFFSET 5");
    }

    #[test]
    fn test_invalid_statements() {
        assert!(SqlQueryBuilder::new(SqlDialect::Sqlite).to_sql().is_err());
        assert!(
            SqlQueryBuilder::new(SqlDialect::Sqlite)
                .insert_values("t", vec![])
                .to_sql()
                .is_err()
        );
        assert!(
            SqlQueryBuilder::new(SqlDialect::Sqlite)
                .from("bad table")
                .to_sql()
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unbound_terminals_fail() {
        let qb = SqlQueryBuilder::new(SqlDialect::Sqlite).from("t");
        assert!(matches!(qb.execute().await, Err(DbError::InvalidInput { .. })));
        assert!(matches!(qb.execute_one().await, Err(DbError::InvalidInput { .. })));
        assert!(matches!(
            qb.execute_update().await,
            Err(DbError::InvalidInput { .. })
        ));
    }
}
