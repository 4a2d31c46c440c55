//! omnidb
//!
//! A unified data-access layer over MySQL, PostgreSQL, SQLite and MongoDB,
//! with fluent query builders and a schema-driven model engine on top.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod i18n;
pub mod logging;
pub mod manager;
pub mod model;
pub mod query;

pub use config::{BackendOptions, ConnectionConfig, DatabaseType, PoolOptions};
pub use db::{Adapter, ExecuteRequest, ExecuteResult, QueryParam, QueryRequest, Record};
pub use error::{DbError, DbResult};
pub use manager::{DEFAULT_CONNECTION, DatabaseManager};
pub use model::{Model, ModelDefinition, ModelInstance};
pub use query::{DocumentQueryBuilder, SqlQueryBuilder};
