//! Request, result and value types shared by every backend.

use crate::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// One row or document: an ordered JSON object.
pub type Record = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Point in time, bound as the backend's native timestamp type
    Timestamp(DateTime<Utc>),
    /// Arrays and objects, bound as JSON
    Json(JsonValue),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Parse an RFC 3339 (or `YYYY-MM-DD[ HH:MM:SS]`) string into a timestamp
    /// parameter, falling back to the plain JSON mapping.
    pub fn timestamp_from_json(value: &JsonValue) -> Self {
        match value.as_str().and_then(parse_datetime) {
            Some(dt) => Self::Timestamp(dt),
            None => Self::from(value),
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<JsonValue> for QueryParam {
    fn from(value: JsonValue) -> Self {
        Self::from(&value)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// Parse the date/time string shapes the backends hand back.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    use chrono::{NaiveDate, NaiveDateTime};

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// MongoDB sort direction (1 / -1).
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

impl FromStr for SortOrder {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "1" => Ok(Self::Asc),
            "desc" | "-1" => Ok(Self::Desc),
            other => Err(DbError::invalid_input(format!(
                "Invalid sort direction: {}",
                other
            ))),
        }
    }
}

/// Options for document finds, independent of the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    /// Projection: only these fields are returned when set.
    pub fields: Option<Vec<String>>,
}

/// A read request.
#[derive(Debug, Clone)]
pub enum QueryRequest {
    /// SQL text with `?` (or `$n` for PostgreSQL) placeholders.
    Sql {
        sql: String,
        params: Vec<QueryParam>,
    },
    /// Document find.
    Find {
        collection: String,
        filter: Record,
        options: FindOptions,
    },
}

impl QueryRequest {
    pub fn sql(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self::Sql {
            sql: sql.into(),
            params,
        }
    }

    pub fn find(collection: impl Into<String>, filter: Record, options: FindOptions) -> Self {
        Self::Find {
            collection: collection.into(),
            filter,
            options,
        }
    }

    /// SQL text or collection name, for logging.
    pub fn target(&self) -> &str {
        match self {
            Self::Sql { sql, .. } => sql,
            Self::Find { collection, .. } => collection,
        }
    }
}

/// Document write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOp {
    Insert,
    InsertMany,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    Replace,
    FindOneAndUpdate,
    FindOneAndDelete,
    FindOneAndReplace,
}

impl DocumentOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::InsertMany => "insertMany",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
            Self::Replace => "replace",
            Self::FindOneAndUpdate => "findOneAndUpdate",
            Self::FindOneAndDelete => "findOneAndDelete",
            Self::FindOneAndReplace => "findOneAndReplace",
        }
    }
}

impl std::fmt::Display for DocumentOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentOp {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "insert" | "insertOne" => Self::Insert,
            "insertMany" => Self::InsertMany,
            "update" | "updateOne" => Self::Update,
            "updateMany" => Self::UpdateMany,
            "delete" | "deleteOne" => Self::Delete,
            "deleteMany" => Self::DeleteMany,
            "replace" | "replaceOne" => Self::Replace,
            "findOneAndUpdate" => Self::FindOneAndUpdate,
            "findOneAndDelete" => Self::FindOneAndDelete,
            "findOneAndReplace" => Self::FindOneAndReplace,
            other => {
                return Err(DbError::invalid_input(format!(
                    "Unsupported document operation: {}",
                    other
                )));
            }
        })
    }
}

/// A write request.
#[derive(Debug, Clone)]
pub enum ExecuteRequest {
    Sql {
        sql: String,
        params: Vec<QueryParam>,
    },
    /// `data` shape depends on `op`: a document for insert, an array for
    /// insertMany, `{filter, update, upsert?}` for updates, `{filter}` for
    /// deletes, `{filter, replacement, upsert?}` for replace and
    /// `{filter, update|replacement, sort?, returnNew?}` for findOneAnd*.
    Document {
        op: DocumentOp,
        collection: String,
        data: JsonValue,
    },
}

impl ExecuteRequest {
    pub fn sql(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self::Sql {
            sql: sql.into(),
            params,
        }
    }

    pub fn document(op: DocumentOp, collection: impl Into<String>, data: JsonValue) -> Self {
        Self::Document {
            op,
            collection: collection.into(),
            data,
        }
    }

    /// Operation label for logging.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Sql { .. } => "execute",
            Self::Document { op, .. } => op.as_str(),
        }
    }

    /// SQL text or collection name, for logging.
    pub fn target(&self) -> &str {
        match self {
            Self::Sql { sql, .. } => sql,
            Self::Document { collection, .. } => collection,
        }
    }
}

/// Outcome of a write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecuteResult {
    /// Rows (or documents) inserted, modified or deleted.
    pub affected_rows: u64,
    /// Generated key of a single-row insert, if any.
    pub insert_id: Option<JsonValue>,
    /// Generated keys of a multi-document insert.
    pub inserted_ids: Vec<JsonValue>,
    /// Documents matched by an update (document backend).
    pub matched_count: Option<u64>,
    pub upserted_id: Option<JsonValue>,
    /// Document returned by findOneAnd* operations.
    pub document: Option<Record>,
}

/// Index definition for `Adapter::create_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub table: String,
    pub name: String,
    pub fields: Vec<(String, SortOrder)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            fields: Vec::new(),
            unique: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, order: SortOrder) -> Self {
        self.fields.push((name.into(), order));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Result of a health check. Health checks never fail; errors land in `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from(&json!(null)), QueryParam::Null);
        assert_eq!(QueryParam::from(&json!(42)), QueryParam::Int(42));
        assert_eq!(QueryParam::from(&json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(QueryParam::from(&json!("a")), QueryParam::String("a".into()));
        assert_eq!(
            QueryParam::from(&json!({"k": [1]})),
            QueryParam::Json(json!({"k": [1]}))
        );
    }

    #[test]
    fn test_query_param_deserialize_untagged() {
        let params: Vec<QueryParam> = serde_json::from_str(r#"[null, true, 7, 2.5, "x"]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(7),
                QueryParam::Float(2.5),
                QueryParam::String("x".into()),
            ]
        );
    }

    #[test]
    fn test_timestamp_from_json() {
        let p = QueryParam::timestamp_from_json(&json!("2024-03-01T10:00:00Z"));
        assert_eq!(p.type_name(), "timestamp");
        let p = QueryParam::timestamp_from_json(&json!("not a date"));
        assert_eq!(p, QueryParam::String("not a date".into()));
    }

    #[test]
    fn test_parse_datetime_shapes() {
        let expected = parse_datetime("2024-03-01T10:00:00Z").unwrap();
        assert_eq!(parse_datetime("2024-03-01 10:00:00"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01 10:00:00+00:00"), Some(expected));
        assert_eq!(parse_datetime("2024-03-01T12:00:00+02:00"), Some(expected));
        assert!(parse_datetime("2024-03-01").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn test_document_op_parse() {
        assert_eq!("insertMany".parse::<DocumentOp>().unwrap(), DocumentOp::InsertMany);
        assert_eq!("updateOne".parse::<DocumentOp>().unwrap(), DocumentOp::Update);
        assert!("upsertAll".parse::<DocumentOp>().is_err());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert_eq!("1".parse::<SortOrder>().unwrap().as_i32(), 1);
        assert!("sideways".parse::<SortOrder>().is_err());
    }
}
