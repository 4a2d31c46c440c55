//! Build backend-specific sqlx queries with every `QueryParam` bound in order.

use crate::db::value::QueryParam;
use chrono::SecondsFormat;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

pub(crate) fn mysql_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> Query<'q, MySql, MySqlArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // DATETIME columns reject RFC 3339 offsets; bind the naive UTC value
        QueryParam::Timestamp(v) => query.bind(v.naive_utc()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    })
}

pub(crate) fn postgres_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    })
}

pub(crate) fn sqlite_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // Fixed-width UTC text, so string comparison follows time order
        QueryParam::Timestamp(v) => query.bind(v.to_rfc3339_opts(SecondsFormat::Micros, true)),
        QueryParam::Json(v) => query.bind(v.to_string()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    })
}
