//! Named registry of connected adapters.

use crate::config::ConnectionConfig;
use crate::db::adapter::Adapter;
use crate::db::value::HealthCheckResult;
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Name used when callers do not pick one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Registry mapping connection names to live adapters.
///
/// Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct DatabaseManager {
    adapters: Arc<RwLock<HashMap<String, Adapter>>>,
}

impl DatabaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect an adapter for `config` and register it under `name`
    /// (`DEFAULT_CONNECTION` when `None`).
    pub async fn init_database(
        &self,
        config: ConnectionConfig,
        name: Option<&str>,
    ) -> DbResult<Adapter> {
        let name = name.unwrap_or(DEFAULT_CONNECTION).to_string();

        // Early check for existing connection
        {
            let adapters = self.adapters.read().await;
            if adapters.contains_key(&name) {
                return Err(DbError::connection(
                    format!("Connection '{}' already exists", name),
                    "Close it first or use a different connection name",
                ));
            }
        }

        info!(
            connection = %name,
            backend = %config.db_type,
            url = %config.masked_connection_string(),
            "Connecting to database"
        );
        let adapter = Adapter::new(name.clone(), config);
        adapter.connect().await?;

        // Re-check after async work to prevent TOCTOU race
        let duplicate = {
            let mut adapters = self.adapters.write().await;
            if adapters.contains_key(&name) {
                true
            } else {
                adapters.insert(name.clone(), adapter.clone());
                false
            }
        };

        if duplicate {
            adapter.close().await;
            return Err(DbError::connection(
                format!("Connection '{}' already exists", name),
                "Concurrent initialization detected. Try again with a different name.",
            ));
        }

        info!(connection = %name, "Connected successfully");
        Ok(adapter)
    }

    /// Look up a registered adapter.
    pub async fn get_database(&self, name: &str) -> DbResult<Adapter> {
        self.adapters
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::connection_not_found(name))
    }

    /// The adapter registered under `DEFAULT_CONNECTION`.
    pub async fn default_database(&self) -> DbResult<Adapter> {
        self.get_database(DEFAULT_CONNECTION).await
    }

    /// Close and unregister one adapter, or every adapter when `name` is `None`.
    pub async fn close_database(&self, name: Option<&str>) -> DbResult<()> {
        match name {
            Some(name) => {
                let adapter = self
                    .adapters
                    .write()
                    .await
                    .remove(name)
                    .ok_or_else(|| DbError::connection_not_found(name))?;
                adapter.close().await;
                info!(connection = %name, "Connection closed");
            }
            None => {
                let drained: Vec<(String, Adapter)> =
                    self.adapters.write().await.drain().collect();
                for (name, adapter) in drained {
                    info!(connection = %name, "Closing connection");
                    adapter.close().await;
                }
                info!("All connections closed");
            }
        }
        Ok(())
    }

    /// Registered names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.adapters.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.adapters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.adapters.read().await.is_empty()
    }

    /// Health of every registered adapter, sorted by name.
    pub async fn health_check_all(&self) -> Vec<(String, HealthCheckResult)> {
        let adapters: Vec<(String, Adapter)> = self
            .adapters
            .read()
            .await
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.clone()))
            .collect();

        let mut results = Vec::with_capacity(adapters.len());
        for (name, adapter) in adapters {
            results.push((name, adapter.health_check().await));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manager_creation() {
        let manager = DatabaseManager::new();
        assert!(manager.is_empty().await);
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_not_found() {
        let manager = DatabaseManager::new();
        let result = manager.get_database("nonexistent").await;
        assert!(matches!(result, Err(DbError::ConnectionNotFound { .. })));

        let result = manager.close_database(Some("nonexistent")).await;
        assert!(matches!(result, Err(DbError::ConnectionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_init_and_close_sqlite() {
        let manager = DatabaseManager::new();
        let adapter = manager
            .init_database(ConnectionConfig::sqlite(":memory:"), None)
            .await
            .unwrap();
        assert!(adapter.is_connected());
        assert_eq!(manager.list().await, vec![DEFAULT_CONNECTION.to_string()]);

        let duplicate = manager
            .init_database(ConnectionConfig::sqlite(":memory:"), None)
            .await;
        assert!(matches!(duplicate, Err(DbError::Connection { .. })));

        let health = manager.health_check_all().await;
        assert_eq!(health.len(), 1);
        assert!(health[0].1.healthy);

        manager.close_database(None).await.unwrap();
        assert!(manager.is_empty().await);
        assert!(!adapter.is_connected());
    }
}
