//! Model definitions.

use crate::config::DatabaseType;
use crate::db::value::Record;
use crate::error::{DbError, DbResult};
use crate::model::hooks::{HookEvent, HookRegistry};
use crate::model::instance::ModelInstance;
use crate::model::schema::{FieldDef, ModelSchema};
use chrono_tz::Tz;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Named filter fragment.
pub type ScopeFn = Arc<dyn Fn() -> Record + Send + Sync>;
/// Computed read-only field.
pub type VirtualFn = Arc<dyn Fn(&Record) -> JsonValue + Send + Sync>;

pub const DEFAULT_SOFT_DELETE_FIELD: &str = "deleted_at";

/// Creation and update timestamp field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: "created_at".to_string(),
            updated_at: "updated_at".to_string(),
        }
    }
}

/// Everything a `Model` needs to know about one table or collection.
pub struct ModelDefinition {
    pub name: String,
    pub table: String,
    /// Explicit primary key; `id` on SQL backends and `_id` on the document
    /// backend when unset.
    pub primary_key: Option<String>,
    pub schema: ModelSchema,
    pub hooks: HookRegistry,
    pub scopes: BTreeMap<String, ScopeFn>,
    pub virtuals: Vec<(String, VirtualFn)>,
    /// Soft delete marker field.
    pub soft_delete: Option<String>,
    pub timestamps: Option<Timestamps>,
    pub timezone: Option<Tz>,
    pub locale: String,
    /// Read cache TTL applied when a query does not set one.
    pub cache_ttl: Option<u64>,
}

impl std::fmt::Debug for ModelDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDefinition")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("schema", &self.schema)
            .field("hooks", &self.hooks)
            .field("scopes", &self.scopes.keys().collect::<Vec<_>>())
            .field(
                "virtuals",
                &self.virtuals.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("soft_delete", &self.soft_delete)
            .field("timestamps", &self.timestamps)
            .field("timezone", &self.timezone)
            .field("locale", &self.locale)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl ModelDefinition {
    pub fn builder(name: impl Into<String>) -> ModelDefinitionBuilder {
        ModelDefinitionBuilder::new(name)
    }

    pub fn primary_key_for(&self, backend: DatabaseType) -> &str {
        match &self.primary_key {
            Some(pk) => pk,
            None if backend == DatabaseType::MongoDB => "_id",
            None => "id",
        }
    }

    pub fn scope(&self, name: &str) -> DbResult<Record> {
        self.scopes
            .get(name)
            .map(|f| f())
            .ok_or_else(|| DbError::invalid_input(format!("Unknown scope '{}' on model {}", name, self.name)))
    }

    pub fn is_virtual(&self, field: &str) -> bool {
        self.virtuals.iter().any(|(n, _)| n == field)
    }

    /// Fields holding points in time: `Date` schema fields, timestamps and
    /// the soft delete marker.
    pub fn date_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.schema.date_fields().collect();
        if let Some(ts) = &self.timestamps {
            fields.push(&ts.created_at);
            fields.push(&ts.updated_at);
        }
        if let Some(marker) = &self.soft_delete {
            fields.push(marker);
        }
        fields.sort_unstable();
        fields.dedup();
        fields
    }

    pub fn is_date_field(&self, field: &str) -> bool {
        self.schema.get(field).is_some_and(FieldDef::is_date)
            || self
                .timestamps
                .as_ref()
                .is_some_and(|ts| ts.created_at == field || ts.updated_at == field)
            || self.soft_delete.as_deref() == Some(field)
    }
}

/// Builder for `ModelDefinition`.
pub struct ModelDefinitionBuilder {
    name: String,
    table: Option<String>,
    primary_key: Option<String>,
    schema: ModelSchema,
    hooks: HookRegistry,
    scopes: BTreeMap<String, ScopeFn>,
    virtuals: Vec<(String, VirtualFn)>,
    soft_delete: Option<String>,
    timestamps: Option<Timestamps>,
    timezone: Option<String>,
    locale: String,
    cache_ttl: Option<u64>,
}

impl ModelDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            primary_key: None,
            schema: ModelSchema::new(),
            hooks: HookRegistry::new(),
            scopes: BTreeMap::new(),
            virtuals: Vec::new(),
            soft_delete: None,
            timestamps: None,
            timezone: None,
            locale: "en".to_string(),
            cache_ttl: None,
        }
    }

    /// Table or collection name; defaults to the model name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn primary_key(mut self, pk: impl Into<String>) -> Self {
        self.primary_key = Some(pk.into());
        self
    }

    pub fn schema(mut self, schema: ModelSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.schema = self.schema.field(name, def);
        self
    }

    pub fn hook<F>(mut self, event: HookEvent, hook: F) -> Self
    where
        F: Fn(&mut ModelInstance) -> crate::error::DbResult<()> + Send + Sync + 'static,
    {
        self.hooks.on(event, hook);
        self
    }

    pub fn scope<F>(mut self, name: impl Into<String>, scope: F) -> Self
    where
        F: Fn() -> Record + Send + Sync + 'static,
    {
        self.scopes.insert(name.into(), Arc::new(scope));
        self
    }

    pub fn virtual_field<F>(mut self, name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Record) -> JsonValue + Send + Sync + 'static,
    {
        self.virtuals.push((name.into(), Arc::new(compute)));
        self
    }

    /// Enable soft delete with the `deleted_at` marker.
    pub fn soft_delete(self) -> Self {
        self.soft_delete_field(DEFAULT_SOFT_DELETE_FIELD)
    }

    pub fn soft_delete_field(mut self, field: impl Into<String>) -> Self {
        self.soft_delete = Some(field.into());
        self
    }

    /// Enable `created_at` / `updated_at`.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = Some(Timestamps::default());
        self
    }

    pub fn timestamp_fields(mut self, created_at: impl Into<String>, updated_at: impl Into<String>) -> Self {
        self.timestamps = Some(Timestamps {
            created_at: created_at.into(),
            updated_at: updated_at.into(),
        });
        self
    }

    /// IANA timezone name, e.g. `Europe/Berlin`.
    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl = Some(ttl_secs);
        self
    }

    pub fn build(self) -> DbResult<ModelDefinition> {
        if self.name.trim().is_empty() {
            return Err(DbError::invalid_input("Model name must not be empty"));
        }
        let timezone = self
            .timezone
            .map(|tz| {
                tz.parse::<Tz>()
                    .map_err(|_| DbError::invalid_input(format!("Unknown timezone: {}", tz)))
            })
            .transpose()?;
        if let Some(name) = self.virtuals.iter().map(|(n, _)| n).find(|n| self.schema.get(n).is_some()) {
            return Err(DbError::invalid_input(format!(
                "Virtual field '{}' collides with a schema field",
                name
            )));
        }
        Ok(ModelDefinition {
            table: self.table.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            primary_key: self.primary_key,
            schema: self.schema,
            hooks: self.hooks,
            scopes: self.scopes,
            virtuals: self.virtuals,
            soft_delete: self.soft_delete,
            timestamps: self.timestamps,
            timezone,
            locale: self.locale,
            cache_ttl: self.cache_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::FieldType;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let def = ModelDefinition::builder("users").build().unwrap();
        assert_eq!(def.table, "users");
        assert_eq!(def.primary_key_for(DatabaseType::SQLite), "id");
        assert_eq!(def.primary_key_for(DatabaseType::MongoDB), "_id");
        assert_eq!(def.locale, "en");
        assert!(def.soft_delete.is_none());
    }

    #[test]
    fn test_date_fields() {
        let def = ModelDefinition::builder("posts")
            .field("published_on", FieldDef::new(FieldType::Date))
            .field("title", FieldDef::new(FieldType::String))
            .timestamps()
            .soft_delete()
            .build()
            .unwrap();
        assert_eq!(
            def.date_fields(),
            vec!["created_at", "deleted_at", "published_on", "updated_at"]
        );
        assert!(def.is_date_field("deleted_at"));
        assert!(!def.is_date_field("title"));
    }

    #[test]
    fn test_unknown_scope() {
        let def = ModelDefinition::builder("users")
            .scope("active", || json!({"status": "active"}).as_object().cloned().unwrap_or_default())
            .build()
            .unwrap();
        assert_eq!(def.scope("active").unwrap().get("status"), Some(&json!("active")));
        assert!(matches!(def.scope("nope"), Err(DbError::InvalidInput { .. })));
    }

    #[test]
    fn test_invalid_timezone() {
        let err = ModelDefinition::builder("users").timezone("Mars/Olympus").build();
        assert!(err.is_err());
        let def = ModelDefinition::builder("users").timezone("Europe/Berlin").build().unwrap();
        assert_eq!(def.timezone, Some(chrono_tz::Europe::Berlin));
    }

    #[test]
    fn test_virtual_collision() {
        let err = ModelDefinition::builder("users")
            .field("full_name", FieldDef::new(FieldType::String))
            .virtual_field("full_name", |_| json!(""))
            .build();
        assert!(err.is_err());
    }
}
