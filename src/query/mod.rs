//! Query builders.
//!
//! - `sql`: fluent SQL text builder with per-dialect quoting and placeholders
//! - `document`: OR-of-AND-branches filter builder with find options
//! - `filter`: lowering of document filters to SQL conditions

pub mod document;
pub mod filter;
pub mod sql;

pub use document::{DocumentQueryBuilder, IntoFilter, and_filters};
pub use filter::{SqlFilter, lower_filter};
pub use sql::{SqlDialect, SqlQueryBuilder};
