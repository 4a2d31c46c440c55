//! Query logging and tracing setup.
//!
//! Adapters report every query/execute to an optional `QueryLogger`. The
//! default logger forwards entries to `tracing`; applications can plug in
//! their own sink (audit tables, metrics) by implementing the trait.

use crate::config::DatabaseType;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// One logged adapter operation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    /// Adapter name the operation ran on.
    pub connection: String,
    pub backend: DatabaseType,
    /// "query", "execute", or the document operation name ("insert", "count", ...).
    pub operation: String,
    /// SQL text, or the collection name for document operations.
    pub target: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub in_transaction: bool,
}

/// Sink for adapter query logs.
pub trait QueryLogger: Send + Sync {
    fn log(&self, entry: &QueryLogEntry);
}

/// Default logger: emits each entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log(&self, entry: &QueryLogEntry) {
        if entry.success {
            tracing::info!(
                connection = %entry.connection,
                backend = %entry.backend,
                operation = %entry.operation,
                target = %entry.target,
                duration_ms = entry.duration_ms,
                in_transaction = entry.in_transaction,
                "Query completed"
            );
        } else {
            tracing::warn!(
                connection = %entry.connection,
                backend = %entry.backend,
                operation = %entry.operation,
                target = %entry.target,
                duration_ms = entry.duration_ms,
                in_transaction = entry.in_transaction,
                error = entry.error.as_deref().unwrap_or_default(),
                "Query failed"
            );
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Returns an error if a global
/// subscriber is already set.
pub fn init_tracing(
    level: &str,
    json: bool,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collecting(Mutex<Vec<QueryLogEntry>>);

    impl QueryLogger for Collecting {
        fn log(&self, entry: &QueryLogEntry) {
            self.0.lock().unwrap().push(entry.clone());
        }
    }

    fn entry(success: bool) -> QueryLogEntry {
        QueryLogEntry {
            connection: "default".to_string(),
            backend: DatabaseType::SQLite,
            operation: "query".to_string(),
            target: "SELECT 1".to_string(),
            duration_ms: 3,
            success,
            error: (!success).then(|| "boom".to_string()),
            in_transaction: false,
        }
    }

    #[test]
    fn test_custom_logger_receives_entries() {
        let logger = Collecting(Mutex::new(Vec::new()));
        logger.log(&entry(true));
        logger.log(&entry(false));
        let entries = logger.0.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_entry_serializes() {
        let json = serde_json::to_value(entry(true)).unwrap();
        assert_eq!(json["backend"], "sqlite");
        assert_eq!(json["target"], "SELECT 1");
    }

    #[test]
    fn test_tracing_logger_does_not_panic_without_subscriber() {
        TracingQueryLogger.log(&entry(true));
        TracingQueryLogger.log(&entry(false));
    }
}
