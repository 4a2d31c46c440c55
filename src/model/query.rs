//! Model-bound queries.
//!
//! `ModelQuery` wraps a `DocumentQueryBuilder` with the model's scopes and
//! soft delete scope and carries the terminal operations. The compiled
//! filter is the user filter ANDed with named scopes and the trash scope.

use crate::db::value::{DocumentOp, FindOptions, Record, SortOrder};
use crate::error::{DbError, DbResult};
use crate::model::engine::{Model, TrashScope, now_value};
use crate::model::instance::ModelInstance;
use crate::model::validation::{ValidationContext, validate_record};
use crate::query::document::{DocumentQueryBuilder, IntoFilter, and_filters};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, total: u64, page: u64, per_page: u64) -> Self {
        Self {
            items,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

fn page_window(page: u64, per_page: u64) -> DbResult<u64> {
    if page == 0 || per_page == 0 {
        return Err(DbError::invalid_input("page and per_page must be at least 1"));
    }
    (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| DbError::invalid_input("page * per_page is out of range"))
}

/// Plain `field: value` equalities of a filter, used to seed created rows.
fn equality_fields(filter: &Record) -> Record {
    let mut out = Record::new();
    for (key, value) in filter {
        match (key.as_str(), value) {
            ("$and", JsonValue::Array(items)) => {
                for item in items.iter().filter_map(JsonValue::as_object) {
                    out.extend(equality_fields(item));
                }
            }
            (k, _) if k.starts_with('$') => {}
            (_, JsonValue::Object(ops)) if ops.keys().any(|k| k.starts_with('$')) => {
                if let Some(eq) = ops.get("$eq") {
                    out.insert(key.clone(), eq.clone());
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Fluent query over one model.
#[derive(Debug, Clone)]
pub struct ModelQuery {
    model: Model,
    builder: DocumentQueryBuilder,
    scopes: Vec<String>,
    trashed: TrashScope,
}

impl ModelQuery {
    pub(crate) fn new(model: Model) -> Self {
        Self {
            model,
            builder: DocumentQueryBuilder::new(),
            scopes: Vec::new(),
            trashed: TrashScope::Exclude,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn where_(mut self, cond: impl IntoFilter) -> Self {
        self.builder = self.builder.where_(cond);
        self
    }

    pub fn and_where(mut self, cond: impl IntoFilter) -> Self {
        self.builder = self.builder.and_where(cond);
        self
    }

    pub fn or_where(mut self, cond: impl IntoFilter) -> Self {
        self.builder = self.builder.or_where(cond);
        self
    }

    pub fn like(mut self, fields: impl IntoFilter) -> Self {
        self.builder = self.builder.like(fields);
        self
    }

    pub fn and_like(mut self, fields: impl IntoFilter) -> Self {
        self.builder = self.builder.and_like(fields);
        self
    }

    pub fn or_like(mut self, fields: impl IntoFilter) -> Self {
        self.builder = self.builder.or_like(fields);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.builder = self.builder.sort(field, order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.builder = self.builder.limit(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.builder = self.builder.skip(skip);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builder = self.builder.fields(fields);
        self
    }

    pub fn cache(mut self, ttl_secs: u64) -> Self {
        self.builder = self.builder.cache(ttl_secs);
        self
    }

    /// AND a named scope into the filter.
    pub fn scope(mut self, name: impl Into<String>) -> Self {
        self.scopes.push(name.into());
        self
    }

    pub fn with_trashed(mut self) -> Self {
        self.trashed = TrashScope::Include;
        self
    }

    pub fn only_trashed(mut self) -> Self {
        self.trashed = TrashScope::Only;
        self
    }

    /// Plain records instead of instances.
    pub fn as_array(mut self) -> RecordQuery {
        self.builder = self.builder.as_array();
        RecordQuery { inner: self }
    }

    pub fn options(&self) -> &FindOptions {
        self.builder.options()
    }

    fn filter_in(&self, scope: TrashScope, extra: Option<Record>) -> DbResult<Record> {
        let mut parts = vec![self.builder.build_filter()?];
        for name in &self.scopes {
            parts.push(self.model.definition().scope(name)?);
        }
        parts.extend(extra);
        parts.push(self.model.trash_filter(scope));
        Ok(and_filters(parts))
    }

    /// The filter sent to the backend.
    pub fn compiled_filter(&self) -> DbResult<Record> {
        self.filter_in(self.trashed, None)
    }

    fn with_id(&self, id: JsonValue, scope: TrashScope) -> DbResult<Record> {
        self.filter_in(scope, Some(self.model.pk_filter(id)))
    }

    async fn rows(&self, filter: &Record, options: &FindOptions) -> DbResult<Vec<Record>> {
        self.model.fetch(filter, options, self.builder.cache_ttl()).await
    }

    fn first_options(&self) -> FindOptions {
        FindOptions {
            limit: Some(1),
            ..self.options().clone()
        }
    }

    async fn first_in(&self, filter: &Record) -> DbResult<Option<ModelInstance>> {
        let rows = self.rows(filter, &self.first_options()).await?;
        Ok(rows.into_iter().next().map(|row| self.model.hydrate(row)))
    }

    async fn validate_changes(&self, changes: &Record, current_id: Option<&JsonValue>) -> DbResult<()> {
        let ctx = ValidationContext {
            group: Some("update"),
            partial: true,
            current_id,
        };
        validate_record(&self.model, changes, changes, ctx).await
    }

    /// Strip virtuals and stamp `updated_at`.
    fn bulk_changes(&self, changes: Record) -> Record {
        let mut changes = self.model.persistable(&changes);
        if let Some(ts) = &self.model.definition().timestamps {
            changes.insert(ts.updated_at.clone(), now_value());
        }
        changes
    }

    fn require_soft_delete(&self) -> DbResult<String> {
        self.model.definition().soft_delete.clone().ok_or_else(|| {
            DbError::invalid_input(format!("Model {} does not use soft delete", self.model.name()))
        })
    }

    // Reads

    pub async fn find_all(&self) -> DbResult<Vec<ModelInstance>> {
        let rows = self.rows(&self.compiled_filter()?, self.options()).await?;
        Ok(rows.into_iter().map(|row| self.model.hydrate(row)).collect())
    }

    pub async fn all(&self) -> DbResult<Vec<ModelInstance>> {
        self.find_all().await
    }

    pub async fn find_one(&self) -> DbResult<Option<ModelInstance>> {
        self.first_in(&self.compiled_filter()?).await
    }

    pub async fn one(&self) -> DbResult<Option<ModelInstance>> {
        self.find_one().await
    }

    pub async fn find_by_id(&self, id: impl Into<JsonValue>) -> DbResult<Option<ModelInstance>> {
        let filter = self.with_id(id.into(), self.trashed)?;
        self.first_in(&filter).await
    }

    pub async fn count(&self) -> DbResult<u64> {
        self.model.count_where(&self.compiled_filter()?).await
    }

    pub async fn exists(&self) -> DbResult<bool> {
        Ok(self.count().await? > 0)
    }

    pub async fn distinct(&self, field: &str) -> DbResult<Vec<JsonValue>> {
        self.model.distinct_where(field, &self.compiled_filter()?).await
    }

    /// Run `pipeline` after a `$match` on the compiled filter. Document
    /// backend only.
    pub async fn aggregate(&self, pipeline: Vec<Record>) -> DbResult<Vec<Record>> {
        self.model.aggregate_where(&self.compiled_filter()?, pipeline).await
    }

    pub async fn paginate(&self, page: u64, per_page: u64) -> DbResult<Page<ModelInstance>> {
        let skip = page_window(page, per_page)?;
        let filter = self.compiled_filter()?;
        let total = self.model.count_where(&filter).await?;
        let options = FindOptions {
            limit: Some(per_page),
            skip: Some(skip),
            ..self.options().clone()
        };
        let items = self
            .rows(&filter, &options)
            .await?
            .into_iter()
            .map(|row| self.model.hydrate(row))
            .collect();
        Ok(Page::new(items, total, page, per_page))
    }

    // Single-record writes (instance pipeline, hooks run)

    /// Update the first match.
    pub async fn update(&self, changes: Record) -> DbResult<Option<ModelInstance>> {
        let Some(mut instance) = self.find_one().await? else {
            return Ok(None);
        };
        instance.update(changes).await?;
        Ok(Some(instance))
    }

    pub async fn update_by_id(
        &self,
        id: impl Into<JsonValue>,
        changes: Record,
    ) -> DbResult<Option<ModelInstance>> {
        let Some(mut instance) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        instance.update(changes).await?;
        Ok(Some(instance))
    }

    /// Update the first match, or create from the filter's equalities plus
    /// `data`.
    pub async fn upsert(&self, data: Record) -> DbResult<ModelInstance> {
        if let Some(mut instance) = self.find_one().await? {
            instance.update(data).await?;
            return Ok(instance);
        }
        let mut record = equality_fields(&self.builder.build_filter()?);
        record.extend(data);
        self.model.create(record).await
    }

    /// The first match, or a new record built from the filter's equalities
    /// plus `defaults`. The flag is true when the record was created.
    pub async fn find_or_create(&self, defaults: Record) -> DbResult<(ModelInstance, bool)> {
        if let Some(instance) = self.find_one().await? {
            return Ok((instance, false));
        }
        let mut record = equality_fields(&self.builder.build_filter()?);
        record.extend(defaults);
        Ok((self.model.create(record).await?, true))
    }

    pub async fn delete(&self) -> DbResult<bool> {
        let Some(mut instance) = self.find_one().await? else {
            return Ok(false);
        };
        instance.delete().await?;
        Ok(true)
    }

    pub async fn delete_by_id(&self, id: impl Into<JsonValue>) -> DbResult<bool> {
        let Some(mut instance) = self.find_by_id(id).await? else {
            return Ok(false);
        };
        instance.delete().await?;
        Ok(true)
    }

    pub async fn restore_by_id(&self, id: impl Into<JsonValue>) -> DbResult<bool> {
        self.require_soft_delete()?;
        let filter = self.with_id(id.into(), TrashScope::Only)?;
        let Some(mut instance) = self.first_in(&filter).await? else {
            return Ok(false);
        };
        instance.restore().await?;
        Ok(true)
    }

    pub async fn force_delete_by_id(&self, id: impl Into<JsonValue>) -> DbResult<bool> {
        let filter = self.with_id(id.into(), TrashScope::Include)?;
        let Some(mut instance) = self.first_in(&filter).await? else {
            return Ok(false);
        };
        instance.force_delete().await?;
        Ok(true)
    }

    /// Add `amount` to `field` on the first match and return it refreshed.
    pub async fn increment(&self, field: &str, amount: i64) -> DbResult<Option<ModelInstance>> {
        let Some(mut instance) = self.find_one().await? else {
            return Ok(None);
        };
        let Some(id) = instance.id().cloned() else {
            return Ok(None);
        };
        self.model
            .increment_where(&self.model.pk_filter(id), field, amount, false)
            .await?;
        instance.reload().await?;
        Ok(Some(instance))
    }

    pub async fn decrement(&self, field: &str, amount: i64) -> DbResult<Option<ModelInstance>> {
        self.increment(field, -amount).await
    }

    // Find-and-modify (no hooks; the document backend runs these natively)

    /// Apply `changes` to the first match (honoring sort) and return the
    /// updated record. Validation runs against that record, so it may keep
    /// its own unique values. Per-instance hooks do not run.
    pub async fn find_one_and_update(&self, changes: Record) -> DbResult<Option<ModelInstance>> {
        let filter = self.compiled_filter()?;
        let Some(mut instance) = self.first_in(&filter).await? else {
            return Ok(None);
        };
        let Some(id) = instance.id().cloned() else {
            return Ok(None);
        };
        self.validate_changes(&changes, Some(&id)).await?;
        let changes = self.bulk_changes(changes);
        if changes.is_empty() {
            return Ok(Some(instance));
        }
        if self.model.is_document() {
            // Original filter, narrowed to the looked-up record
            let target = and_filters([filter, self.model.pk_filter(id)]);
            let update = json!({"$set": self.model.document_values(&changes)});
            let found = self
                .model
                .find_one_and(DocumentOp::FindOneAndUpdate, &target, &FindOptions::default(), Some(("update", update)))
                .await?;
            return Ok(found.map(|row| self.model.hydrate(row)));
        }
        self.model
            .update_where(&self.model.pk_filter(id), &changes, false)
            .await?;
        instance.apply_persisted(changes);
        Ok(Some(instance))
    }

    /// Remove (or soft-delete) the first match and return it as it was.
    /// Per-instance hooks do not run.
    pub async fn find_one_and_delete(&self) -> DbResult<Option<ModelInstance>> {
        let filter = self.compiled_filter()?;
        let marker = self.model.definition().soft_delete.clone();
        if self.model.is_document() {
            let found = match &marker {
                Some(marker) => {
                    let mut set = Record::new();
                    set.insert(marker.clone(), now_value());
                    let update = json!({"$set": self.model.document_values(&set)});
                    self.model
                        .find_one_and(DocumentOp::FindOneAndUpdate, &filter, self.options(), Some(("update", update)))
                        .await?
                }
                None => {
                    self.model
                        .find_one_and(DocumentOp::FindOneAndDelete, &filter, self.options(), None)
                        .await?
                }
            };
            return Ok(found.map(|row| self.model.hydrate(row)));
        }
        let Some(mut instance) = self.first_in(&filter).await? else {
            return Ok(None);
        };
        let Some(id) = instance.id().cloned() else {
            return Ok(None);
        };
        let target = self.model.pk_filter(id);
        match marker {
            Some(marker) => {
                let mut changes = Record::new();
                changes.insert(marker, now_value());
                self.model.update_where(&target, &changes, false).await?;
                instance.apply_persisted(changes);
            }
            None => {
                self.model.delete_where(&target, false).await?;
            }
        }
        Ok(Some(instance))
    }

    /// Replace the first match's fields with `replacement`, keeping its
    /// primary key, creation time and soft delete marker. Per-instance
    /// hooks do not run.
    pub async fn find_one_and_replace(&self, replacement: Record) -> DbResult<Option<ModelInstance>> {
        let Some(mut instance) = self.find_one().await? else {
            return Ok(None);
        };
        let Some(id) = instance.id().cloned() else {
            return Ok(None);
        };
        let replacement = self.model.persistable(&replacement);
        let ctx = ValidationContext {
            group: Some("update"),
            partial: false,
            current_id: Some(&id),
        };
        validate_record(&self.model, &replacement, &replacement, ctx).await?;

        let definition = self.model.definition().clone();
        let pk = self.model.primary_key().to_string();
        let mut kept: Vec<&str> = vec![pk.as_str()];
        if let Some(ts) = &definition.timestamps {
            kept.push(&ts.created_at);
        }
        if let Some(marker) = &definition.soft_delete {
            kept.push(marker);
        }

        let mut next = Record::new();
        for field in &kept {
            if let Some(v) = instance.get(field) {
                next.insert(field.to_string(), v.clone());
            }
        }
        next.extend(replacement.into_iter().filter(|(k, _)| *k != pk));
        if let Some(ts) = &definition.timestamps {
            next.insert(ts.updated_at.clone(), now_value());
        }

        let target = self.model.pk_filter(id);
        if self.model.is_document() {
            let mut document = self.model.document_values(&next);
            document.remove(&pk);
            self.model
                .find_one_and(
                    DocumentOp::FindOneAndReplace,
                    &target,
                    &FindOptions::default(),
                    Some(("replacement", JsonValue::Object(document))),
                )
                .await?;
        } else {
            let mut changes = next.clone();
            for field in instance.data().keys() {
                if !changes.contains_key(field) && !definition.is_virtual(field) {
                    changes.insert(field.clone(), JsonValue::Null);
                }
            }
            changes.remove(&pk);
            self.model.update_where(&target, &changes, false).await?;
        }
        instance.replace_persisted(next);
        Ok(Some(instance))
    }

    // Bulk writes (no hooks)

    pub async fn update_many(&self, changes: Record) -> DbResult<u64> {
        self.validate_changes(&changes, None).await?;
        let changes = self.bulk_changes(changes);
        let updated = self
            .model
            .update_where(&self.compiled_filter()?, &changes, true)
            .await?;
        debug!(model = %self.model.name(), updated, "Bulk update");
        Ok(updated)
    }

    pub async fn increment_many(&self, field: &str, amount: i64) -> DbResult<u64> {
        self.model
            .increment_where(&self.compiled_filter()?, field, amount, true)
            .await
    }

    pub async fn decrement_many(&self, field: &str, amount: i64) -> DbResult<u64> {
        self.increment_many(field, -amount).await
    }

    /// Soft-delete (or remove) every match.
    pub async fn delete_many(&self) -> DbResult<u64> {
        let filter = self.compiled_filter()?;
        let removed = match &self.model.definition().soft_delete {
            Some(marker) => {
                let mut changes = Record::new();
                changes.insert(marker.clone(), now_value());
                self.model.update_where(&filter, &changes, true).await?
            }
            None => self.model.delete_where(&filter, true).await?,
        };
        debug!(model = %self.model.name(), removed, "Bulk delete");
        Ok(removed)
    }

    /// Clear the marker on every soft-deleted match.
    pub async fn restore(&self) -> DbResult<u64> {
        let marker = self.require_soft_delete()?;
        let filter = self.filter_in(TrashScope::Only, None)?;
        let mut changes = Record::new();
        changes.insert(marker, JsonValue::Null);
        self.model.update_where(&filter, &changes, true).await
    }

    /// Remove every match, soft-deleted rows included unless the query is
    /// restricted to them.
    pub async fn force_delete(&self) -> DbResult<u64> {
        let scope = match self.trashed {
            TrashScope::Only => TrashScope::Only,
            _ => TrashScope::Include,
        };
        let filter = self.filter_in(scope, None)?;
        self.model.delete_where(&filter, true).await
    }
}

/// A query returning plain records: no instances, virtuals or timezone
/// formatting.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    inner: ModelQuery,
}

impl RecordQuery {
    pub async fn find_all(&self) -> DbResult<Vec<Record>> {
        self.inner
            .rows(&self.inner.compiled_filter()?, self.inner.options())
            .await
    }

    pub async fn all(&self) -> DbResult<Vec<Record>> {
        self.find_all().await
    }

    pub async fn find_one(&self) -> DbResult<Option<Record>> {
        let rows = self
            .inner
            .rows(&self.inner.compiled_filter()?, &self.inner.first_options())
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn one(&self) -> DbResult<Option<Record>> {
        self.find_one().await
    }

    pub async fn find_by_id(&self, id: impl Into<JsonValue>) -> DbResult<Option<Record>> {
        let filter = self.inner.with_id(id.into(), self.inner.trashed)?;
        let rows = self.inner.rows(&filter, &self.inner.first_options()).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn count(&self) -> DbResult<u64> {
        self.inner.count().await
    }

    pub async fn exists(&self) -> DbResult<bool> {
        self.inner.exists().await
    }

    pub async fn distinct(&self, field: &str) -> DbResult<Vec<JsonValue>> {
        self.inner.distinct(field).await
    }

    pub async fn aggregate(&self, pipeline: Vec<Record>) -> DbResult<Vec<Record>> {
        self.inner.aggregate(pipeline).await
    }

    pub async fn paginate(&self, page: u64, per_page: u64) -> DbResult<Page<Record>> {
        let skip = page_window(page, per_page)?;
        let filter = self.inner.compiled_filter()?;
        let total = self.inner.model.count_where(&filter).await?;
        let options = FindOptions {
            limit: Some(per_page),
            skip: Some(skip),
            ..self.inner.options().clone()
        };
        let items = self.inner.rows(&filter, &options).await?;
        Ok(Page::new(items, total, page, per_page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::db::adapter::Adapter;
    use crate::model::definition::ModelDefinition;

    fn rec(v: JsonValue) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn model() -> Model {
        let definition = ModelDefinition::builder("users")
            .scope("active", || rec(json!({"status": "active"})))
            .soft_delete()
            .build()
            .unwrap();
        Model::new(definition, Adapter::new("test", ConnectionConfig::sqlite(":memory:")))
    }

    #[test]
    fn test_compiled_filter_ands_scopes_and_trash() {
        let q = model().where_(json!({"age": {"$gt": 20}})).scope("active");
        assert_eq!(
            JsonValue::Object(q.compiled_filter().unwrap()),
            json!({"$and": [
                {"age": {"$gt": 20}},
                {"status": "active"},
                {"deleted_at": null}
            ]})
        );
    }

    #[test]
    fn test_trash_scopes() {
        let m = model();
        assert_eq!(
            JsonValue::Object(m.with_trashed().compiled_filter().unwrap()),
            json!({})
        );
        assert_eq!(
            JsonValue::Object(m.only_trashed().compiled_filter().unwrap()),
            json!({"deleted_at": {"$ne": null}})
        );
    }

    #[test]
    fn test_unknown_scope_is_invalid_input() {
        let err = model().scope("nope").compiled_filter().unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_equality_fields() {
        let filter = rec(json!({
            "$and": [{"email": "a@b.co"}, {"age": {"$gt": 3}}],
            "role": {"$eq": "admin"},
            "$or": [{"x": 1}]
        }));
        assert_eq!(
            JsonValue::Object(equality_fields(&filter)),
            json!({"email": "a@b.co", "role": "admin"})
        );
    }

    #[test]
    fn test_page_math() {
        let page = Page::new(vec![1, 2], 5, 1, 2);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next());
        assert!(!page.has_prev());
        assert!(page_window(0, 10).is_err());
        assert_eq!(page_window(3, 10).unwrap(), 20);
        assert!(matches!(
            page_window(u64::MAX, 2),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
