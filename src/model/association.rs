//! Associations between models.
//!
//! Each association runs one query against the related model, so its
//! scopes and soft delete scope apply unless overridden.

use crate::db::value::{Record, SortOrder};
use crate::error::DbResult;
use crate::model::engine::Model;
use crate::model::instance::ModelInstance;
use crate::model::query::ModelQuery;
use crate::model::validation::is_blank;
use serde_json::Value as JsonValue;

/// Options for loading related records.
#[derive(Debug, Clone, Default)]
pub struct RelationOptions {
    pub fields: Option<Vec<String>>,
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub include_trashed: bool,
    pub only_trashed: bool,
}

impl RelationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    pub fn only_trashed(mut self) -> Self {
        self.only_trashed = true;
        self
    }
}

fn related_query(related: &Model, foreign_key: &str, value: JsonValue, options: &RelationOptions) -> ModelQuery {
    let mut filter = Record::new();
    filter.insert(foreign_key.to_string(), value);
    let mut query = related.where_(filter);
    if options.only_trashed {
        query = query.only_trashed();
    } else if options.include_trashed {
        query = query.with_trashed();
    }
    if let Some(fields) = &options.fields {
        query = query.fields(fields.iter().cloned());
    }
    for (field, order) in &options.sort {
        query = query.sort(field.clone(), *order);
    }
    if let Some(limit) = options.limit {
        query = query.limit(limit);
    }
    if let Some(skip) = options.skip {
        query = query.skip(skip);
    }
    query
}

impl ModelInstance {
    fn key_value(&self, local_key: &str) -> Option<JsonValue> {
        let value = self.get(local_key);
        if is_blank(value) { None } else { value.cloned() }
    }

    /// The record this one points at: `related.foreign_key == self.local_key`.
    pub async fn belongs_to(
        &self,
        related: &Model,
        local_key: &str,
        foreign_key: &str,
        options: RelationOptions,
    ) -> DbResult<Option<ModelInstance>> {
        let Some(value) = self.key_value(local_key) else {
            return Ok(None);
        };
        related_query(related, foreign_key, value, &options).find_one().await
    }

    /// The one record pointing at this one.
    pub async fn has_one(
        &self,
        related: &Model,
        local_key: &str,
        foreign_key: &str,
        options: RelationOptions,
    ) -> DbResult<Option<ModelInstance>> {
        let Some(value) = self.key_value(local_key) else {
            return Ok(None);
        };
        related_query(related, foreign_key, value, &options).find_one().await
    }

    /// Every record pointing at this one.
    pub async fn has_many(
        &self,
        related: &Model,
        local_key: &str,
        foreign_key: &str,
        options: RelationOptions,
    ) -> DbResult<Vec<ModelInstance>> {
        let Some(value) = self.key_value(local_key) else {
            return Ok(Vec::new());
        };
        related_query(related, foreign_key, value, &options).find_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::db::adapter::Adapter;
    use crate::model::definition::ModelDefinition;
    use serde_json::json;

    #[test]
    fn test_related_query_filter() {
        let posts = Model::new(
            ModelDefinition::builder("posts").soft_delete().build().unwrap(),
            Adapter::new("test", ConnectionConfig::sqlite(":memory:")),
        );
        let options = RelationOptions::new().sort("id", SortOrder::Desc).limit(5);
        let q = related_query(&posts, "user_id", json!(7), &options);
        assert_eq!(
            JsonValue::Object(q.compiled_filter().unwrap()),
            json!({"$and": [{"user_id": 7}, {"deleted_at": null}]})
        );
        assert_eq!(q.options().limit, Some(5));

        let q = related_query(&posts, "user_id", json!(7), &RelationOptions::new().with_trashed());
        assert_eq!(JsonValue::Object(q.compiled_filter().unwrap()), json!({"user_id": 7}));
    }
}
