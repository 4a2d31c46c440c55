//! Model instances and their write pipelines.

use crate::db::value::Record;
use crate::error::{DbError, DbResult};
use crate::model::engine::{Model, TrashScope, now_value};
use crate::model::hooks::HookEvent;
use crate::model::validation::{ValidationContext, is_blank, validate_record};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

/// One record bound to its model, with change tracking.
#[derive(Clone)]
pub struct ModelInstance {
    model: Model,
    data: Record,
    /// Snapshot of the last persisted state.
    original: Record,
    persisted: bool,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("model", &self.model.name())
            .field("persisted", &self.persisted)
            .field("data", &self.data)
            .finish()
    }
}

impl Serialize for ModelInstance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl ModelInstance {
    pub(crate) fn new(model: Model, data: Record) -> Self {
        Self {
            model,
            data,
            original: Record::new(),
            persisted: false,
        }
    }

    pub(crate) fn from_row(model: Model, data: Record) -> Self {
        Self {
            model,
            original: data.clone(),
            data,
            persisted: true,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.data.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<JsonValue>) {
        self.data.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<JsonValue> {
        self.data.remove(field)
    }

    pub fn data(&self) -> &Record {
        &self.data
    }

    pub fn into_record(self) -> Record {
        self.data
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.data.clone())
    }

    /// Primary key value, once known.
    pub fn id(&self) -> Option<&JsonValue> {
        self.data
            .get(self.model.primary_key())
            .filter(|v| !v.is_null())
    }

    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    pub fn is_trashed(&self) -> bool {
        match &self.model.definition().soft_delete {
            Some(marker) => !is_blank(self.data.get(marker)),
            None => false,
        }
    }

    /// Persistable fields that differ from the last persisted state.
    pub fn changes(&self) -> Record {
        let definition = self.model.definition();
        self.data
            .iter()
            .filter(|(k, _)| !definition.is_virtual(k))
            .filter(|(k, v)| self.original.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.changes().is_empty()
    }

    fn run_hooks(&mut self, event: HookEvent) -> DbResult<()> {
        let definition = Arc::clone(self.model.definition());
        definition.hooks.run(event, self)
    }

    fn require_id(&self) -> DbResult<JsonValue> {
        match (self.persisted, self.id()) {
            (true, Some(id)) => Ok(id.clone()),
            _ => Err(DbError::invalid_input(format!(
                "{} instance has not been persisted",
                self.model.name()
            ))),
        }
    }

    fn sync_original(&mut self) {
        self.model.present(&mut self.data);
        self.original = self.data.clone();
    }

    /// Record writes made outside the instance pipeline.
    pub(crate) fn apply_persisted(&mut self, changes: Record) {
        self.data.extend(changes);
        self.sync_original();
    }

    pub(crate) fn replace_persisted(&mut self, data: Record) {
        self.data = data;
        self.sync_original();
    }

    /// Insert when new, otherwise write the pending changes.
    pub async fn save(&mut self) -> DbResult<()> {
        if self.persisted {
            self.save_existing().await
        } else {
            self.validate_new().await?;
            self.insert().await
        }
    }

    /// Apply `changes` and save them.
    pub async fn update(&mut self, changes: Record) -> DbResult<()> {
        for (field, value) in changes {
            self.data.insert(field, value);
        }
        self.save().await
    }

    /// Validation half of the create pipeline.
    pub(crate) async fn validate_new(&mut self) -> DbResult<()> {
        self.run_hooks(HookEvent::BeforeValidate)?;
        let record = self.model.persistable(&self.data);
        let ctx = ValidationContext {
            group: Some("create"),
            ..ValidationContext::default()
        };
        validate_record(&self.model, &record, &record, ctx).await?;
        self.run_hooks(HookEvent::AfterValidate)
    }

    /// Persistence half of the create pipeline.
    pub(crate) async fn insert(&mut self) -> DbResult<()> {
        self.run_hooks(HookEvent::BeforeCreate)?;
        self.run_hooks(HookEvent::BeforeSave)?;

        if let Some(ts) = self.model.definition().timestamps.clone() {
            let now = now_value();
            for field in [ts.created_at, ts.updated_at] {
                if is_blank(self.data.get(&field)) {
                    self.data.insert(field, now.clone());
                }
            }
        }

        let record = self.model.persistable(&self.data);
        let id = self.model.insert_record(&record).await?;
        let pk = self.model.primary_key().to_string();
        if let Some(id) = id {
            if is_blank(self.data.get(&pk)) {
                self.data.insert(pk, id);
            }
        }
        self.persisted = true;
        self.sync_original();
        debug!(model = %self.model.name(), id = ?self.id(), "Created");

        self.run_hooks(HookEvent::AfterSave)?;
        self.run_hooks(HookEvent::AfterCreate)
    }

    async fn save_existing(&mut self) -> DbResult<()> {
        let id = self.require_id()?;
        self.run_hooks(HookEvent::BeforeValidate)?;
        let changes = self.changes();
        let record = self.model.persistable(&self.data);
        let ctx = ValidationContext {
            group: Some("update"),
            partial: true,
            current_id: Some(&id),
        };
        validate_record(&self.model, &changes, &record, ctx).await?;
        self.run_hooks(HookEvent::AfterValidate)?;

        self.run_hooks(HookEvent::BeforeUpdate)?;
        self.run_hooks(HookEvent::BeforeSave)?;

        let mut changes = self.changes();
        if !changes.is_empty() {
            if let Some(ts) = &self.model.definition().timestamps {
                let now = now_value();
                self.data.insert(ts.updated_at.clone(), now.clone());
                changes.insert(ts.updated_at.clone(), now);
            }
            let filter = self.model.pk_filter(id);
            self.model.update_where(&filter, &changes, false).await?;
            debug!(model = %self.model.name(), id = ?self.id(), fields = changes.len(), "Updated");
        }
        self.sync_original();

        self.run_hooks(HookEvent::AfterSave)?;
        self.run_hooks(HookEvent::AfterUpdate)
    }

    /// Soft-delete when the model has a marker, otherwise hard-delete.
    pub async fn delete(&mut self) -> DbResult<()> {
        let id = self.require_id()?;
        self.run_hooks(HookEvent::BeforeDelete)?;
        let filter = self.model.pk_filter(id);
        match self.model.definition().soft_delete.clone() {
            Some(marker) => {
                let now = now_value();
                let mut changes = Record::new();
                changes.insert(marker.clone(), now.clone());
                self.model.update_where(&filter, &changes, false).await?;
                self.data.insert(marker, now);
                self.sync_original();
            }
            None => {
                self.model.delete_where(&filter, false).await?;
                self.persisted = false;
            }
        }
        debug!(model = %self.model.name(), id = ?self.id(), "Deleted");
        self.run_hooks(HookEvent::AfterDelete)
    }

    /// Clear the soft delete marker.
    pub async fn restore(&mut self) -> DbResult<()> {
        let id = self.require_id()?;
        let Some(marker) = self.model.definition().soft_delete.clone() else {
            return Err(DbError::invalid_input(format!(
                "Model {} does not use soft delete",
                self.model.name()
            )));
        };
        self.run_hooks(HookEvent::BeforeRestore)?;
        let mut changes = Record::new();
        changes.insert(marker.clone(), JsonValue::Null);
        self.model.update_where(&self.model.pk_filter(id), &changes, false).await?;
        self.data.insert(marker, JsonValue::Null);
        self.sync_original();
        debug!(model = %self.model.name(), id = ?self.id(), "Restored");
        self.run_hooks(HookEvent::AfterRestore)
    }

    /// Remove the row even when the model soft-deletes.
    pub async fn force_delete(&mut self) -> DbResult<()> {
        let id = self.require_id()?;
        self.run_hooks(HookEvent::BeforeDelete)?;
        self.model.delete_where(&self.model.pk_filter(id), false).await?;
        self.persisted = false;
        debug!(model = %self.model.name(), id = ?self.id(), "Force deleted");
        self.run_hooks(HookEvent::AfterDelete)
    }

    /// Re-read the persisted state, discarding unsaved changes.
    pub async fn reload(&mut self) -> DbResult<()> {
        let id = self.require_id()?;
        let filter = self.model.pk_filter(id.clone());
        let options = crate::db::value::FindOptions {
            limit: Some(1),
            ..Default::default()
        };
        let scope = self.model.trash_filter(TrashScope::Include);
        let filter = crate::query::document::and_filters([filter, scope]);
        let row = self
            .model
            .fetch(&filter, &options, Some(0))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DbError::query(
                    format!("{} with id {} no longer exists", self.model.name(), id),
                    None,
                )
            })?;
        let fresh = self.model.hydrate(row);
        self.data = fresh.data;
        self.original = fresh.original;
        Ok(())
    }
}
