//! Database access layer.
//!
//! - Connection pools and the MongoDB client wrapper
//! - Statement execution per backend
//! - Row decoding and parameter binding
//! - Transactions and savepoints
//! - The `Adapter` contract tying them together

pub mod adapter;
pub mod document;
pub mod params;
pub mod pool;
pub mod retry;
pub mod sql;
pub mod transaction;
pub mod types;
pub mod value;

pub use adapter::{Adapter, Backend, NativeHandle};
pub use document::DocumentBackend;
pub use pool::{DbPool, PoolState, SqlPool};
pub use retry::RetryPolicy;
pub use sql::SqlBackend;
pub use transaction::{SavepointStack, TransactionContext, TransactionState};
pub use value::{
    DocumentOp, ExecuteRequest, ExecuteResult, FindOptions, HealthCheckResult, IndexSpec,
    QueryParam, QueryRequest, Record, SortOrder,
};
