//! The model engine: a definition bound to an adapter.
//!
//! Every read and write funnels through a handful of primitives here
//! (`fetch`, `count_in`, `insert_record`, `update_where`, `delete_where`,
//! ...). Each primitive renders through `SqlQueryBuilder` on SQL backends
//! and through document requests on the document backend.

use crate::cache::Cache;
use crate::config::DatabaseType;
use crate::db::adapter::Adapter;
use crate::db::value::{
    DocumentOp, ExecuteRequest, FindOptions, QueryParam, QueryRequest, Record, parse_datetime,
};
use crate::error::{DbError, DbResult};
use crate::i18n::{DefaultTranslator, Translator};
use crate::manager::DatabaseManager;
use crate::model::definition::ModelDefinition;
use crate::model::instance::ModelInstance;
use crate::model::query::{ModelQuery, Page};
use crate::model::schema::FieldType;
use crate::model::validation::{ValidationContext, validate_record};
use crate::query::document::IntoFilter;
use crate::query::filter::{SqlFilter, lower_filter};
use crate::query::sql::{SqlDialect, SqlQueryBuilder, quote_identifier};
use chrono::{SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, trace};

/// Which soft-deleted rows a read sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrashScope {
    /// Live rows only.
    #[default]
    Exclude,
    /// Live and soft-deleted rows.
    Include,
    /// Soft-deleted rows only.
    Only,
}

/// A model definition bound to an adapter.
#[derive(Clone)]
pub struct Model {
    definition: Arc<ModelDefinition>,
    adapter: Adapter,
    cache: Option<Arc<dyn Cache>>,
    translator: Arc<dyn Translator>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.definition.name)
            .field("table", &self.definition.table)
            .field("connection", &self.adapter.name())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

fn single(field: &str, value: JsonValue) -> Record {
    let mut record = Record::new();
    record.insert(field.to_string(), value);
    record
}

/// Read a count column that may come back as a number or a string.
fn json_to_u64(value: &JsonValue) -> u64 {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        JsonValue::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Current UTC time in the form written to timestamp fields.
pub(crate) fn now_value() -> JsonValue {
    JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl Model {
    pub fn new(definition: impl Into<Arc<ModelDefinition>>, adapter: Adapter) -> Self {
        Self {
            definition: definition.into(),
            adapter,
            cache: None,
            translator: Arc::new(DefaultTranslator),
        }
    }

    /// Bind to the connection registered under `name`.
    pub async fn bind(
        definition: impl Into<Arc<ModelDefinition>>,
        manager: &DatabaseManager,
        name: &str,
    ) -> DbResult<Self> {
        let adapter = manager.get_database(name).await?;
        Ok(Self::new(definition, adapter))
    }

    /// The same model on another adapter, typically a transaction handle.
    pub fn with_adapter(&self, adapter: Adapter) -> Self {
        Self {
            adapter,
            ..self.clone()
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn definition(&self) -> &Arc<ModelDefinition> {
        &self.definition
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.translator
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn primary_key(&self) -> &str {
        self.definition.primary_key_for(self.adapter.backend())
    }

    pub(crate) fn is_document(&self) -> bool {
        self.adapter.backend() == DatabaseType::MongoDB
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::from(self.adapter.backend())
    }

    // Fluent entry points

    pub fn query(&self) -> ModelQuery {
        ModelQuery::new(self.clone())
    }

    pub fn where_(&self, cond: impl IntoFilter) -> ModelQuery {
        self.query().where_(cond)
    }

    pub fn like(&self, fields: impl IntoFilter) -> ModelQuery {
        self.query().like(fields)
    }

    pub fn scope(&self, name: impl Into<String>) -> ModelQuery {
        self.query().scope(name)
    }

    pub fn with_trashed(&self) -> ModelQuery {
        self.query().with_trashed()
    }

    pub fn only_trashed(&self) -> ModelQuery {
        self.query().only_trashed()
    }

    // CRUD

    /// An unsaved instance; persist it with `save`.
    pub fn build(&self, record: Record) -> ModelInstance {
        ModelInstance::new(self.clone(), record)
    }

    pub async fn create(&self, record: Record) -> DbResult<ModelInstance> {
        let mut instance = self.build(record);
        instance.save().await?;
        Ok(instance)
    }

    /// Create several records. Every record is validated before the first
    /// insert.
    pub async fn create_many(&self, records: Vec<Record>) -> DbResult<Vec<ModelInstance>> {
        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            let mut instance = self.build(record);
            instance.validate_new().await?;
            instances.push(instance);
        }
        for instance in &mut instances {
            instance.insert().await?;
        }
        Ok(instances)
    }

    pub async fn find(&self, id: impl Into<JsonValue>) -> DbResult<Option<ModelInstance>> {
        self.query().find_by_id(id).await
    }

    pub async fn find_by_id(&self, id: impl Into<JsonValue>) -> DbResult<Option<ModelInstance>> {
        self.query().find_by_id(id).await
    }

    pub async fn find_all(&self, filter: impl IntoFilter) -> DbResult<Vec<ModelInstance>> {
        self.where_(filter).find_all().await
    }

    pub async fn find_one(&self, filter: impl IntoFilter) -> DbResult<Option<ModelInstance>> {
        self.where_(filter).find_one().await
    }

    /// Update the first match through the instance pipeline.
    pub async fn update(&self, filter: impl IntoFilter, changes: Record) -> DbResult<Option<ModelInstance>> {
        self.where_(filter).update(changes).await
    }

    pub async fn update_by_id(
        &self,
        id: impl Into<JsonValue>,
        changes: Record,
    ) -> DbResult<Option<ModelInstance>> {
        self.query().update_by_id(id, changes).await
    }

    pub async fn update_many(&self, filter: impl IntoFilter, changes: Record) -> DbResult<u64> {
        self.where_(filter).update_many(changes).await
    }

    pub async fn delete(&self, filter: impl IntoFilter) -> DbResult<bool> {
        self.where_(filter).delete().await
    }

    pub async fn delete_by_id(&self, id: impl Into<JsonValue>) -> DbResult<bool> {
        self.query().delete_by_id(id).await
    }

    pub async fn delete_many(&self, filter: impl IntoFilter) -> DbResult<u64> {
        self.where_(filter).delete_many().await
    }

    pub async fn increment(
        &self,
        filter: impl IntoFilter,
        field: &str,
        amount: i64,
    ) -> DbResult<Option<ModelInstance>> {
        self.where_(filter).increment(field, amount).await
    }

    pub async fn decrement(
        &self,
        filter: impl IntoFilter,
        field: &str,
        amount: i64,
    ) -> DbResult<Option<ModelInstance>> {
        self.where_(filter).decrement(field, amount).await
    }

    pub async fn increment_many(&self, filter: impl IntoFilter, field: &str, amount: i64) -> DbResult<u64> {
        self.where_(filter).increment_many(field, amount).await
    }

    pub async fn decrement_many(&self, filter: impl IntoFilter, field: &str, amount: i64) -> DbResult<u64> {
        self.where_(filter).decrement_many(field, amount).await
    }

    pub async fn upsert(&self, filter: impl IntoFilter, data: Record) -> DbResult<ModelInstance> {
        self.where_(filter).upsert(data).await
    }

    pub async fn find_or_create(
        &self,
        filter: impl IntoFilter,
        defaults: Record,
    ) -> DbResult<(ModelInstance, bool)> {
        self.where_(filter).find_or_create(defaults).await
    }

    /// Hard-delete every row, soft-deleted ones included. No hooks run.
    pub async fn truncate(&self) -> DbResult<u64> {
        let removed = self.delete_where(&Record::new(), true).await?;
        debug!(model = %self.definition.name, removed, "Truncated");
        Ok(removed)
    }

    pub async fn count(&self, filter: impl IntoFilter) -> DbResult<u64> {
        self.where_(filter).count().await
    }

    pub async fn exists(&self, filter: impl IntoFilter) -> DbResult<bool> {
        self.where_(filter).exists().await
    }

    pub async fn distinct(&self, field: &str, filter: impl IntoFilter) -> DbResult<Vec<JsonValue>> {
        self.where_(filter).distinct(field).await
    }

    pub async fn paginate(
        &self,
        filter: impl IntoFilter,
        page: u64,
        per_page: u64,
    ) -> DbResult<Page<ModelInstance>> {
        self.where_(filter).paginate(page, per_page).await
    }

    /// Validate `record` as a full record in `group`.
    pub async fn validate(&self, record: &Record, group: Option<&str>) -> DbResult<()> {
        let record = self.persistable(record);
        let ctx = ValidationContext {
            group,
            ..ValidationContext::default()
        };
        validate_record(self, &record, &record, ctx).await
    }

    // Primitives

    pub(crate) fn pk_filter(&self, id: JsonValue) -> Record {
        single(self.primary_key(), id)
    }

    pub(crate) fn trash_filter(&self, scope: TrashScope) -> Record {
        match (&self.definition.soft_delete, scope) {
            (None, _) | (Some(_), TrashScope::Include) => Record::new(),
            (Some(marker), TrashScope::Exclude) => single(marker, JsonValue::Null),
            (Some(marker), TrashScope::Only) => single(marker, json!({"$ne": null})),
        }
    }

    /// Drop virtual fields.
    pub(crate) fn persistable(&self, record: &Record) -> Record {
        record
            .iter()
            .filter(|(k, _)| !self.definition.is_virtual(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn output_timezone(&self) -> Option<Tz> {
        self.definition
            .timezone
            .or_else(|| self.adapter.timezone().and_then(|tz| tz.parse::<Tz>().ok()))
    }

    /// Shape a stored record for callers: booleans, timezone, virtuals.
    pub(crate) fn present(&self, record: &mut Record) {
        for (name, def) in self.definition.schema.iter() {
            if def.field_type != Some(FieldType::Boolean) {
                continue;
            }
            if let Some(slot) = record.get_mut(name) {
                if let Some(n) = slot.as_i64() {
                    *slot = JsonValue::Bool(n != 0);
                }
            }
        }
        if let Some(tz) = self.output_timezone() {
            for field in self.definition.date_fields() {
                let Some(slot) = record.get_mut(field) else {
                    continue;
                };
                if let Some(dt) = slot.as_str().and_then(parse_datetime) {
                    *slot = JsonValue::String(
                        dt.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::AutoSi, false),
                    );
                }
            }
        }
        for (name, compute) in &self.definition.virtuals {
            let value = compute(record);
            record.insert(name.clone(), value);
        }
    }

    pub(crate) fn hydrate(&self, mut record: Record) -> ModelInstance {
        for name in self.definition.virtuals.iter().map(|(n, _)| n) {
            record.remove(name);
        }
        self.present(&mut record);
        ModelInstance::from_row(self.clone(), record)
    }

    fn cache_key(&self, filter: &Record, options: &FindOptions) -> String {
        format!(
            "{}:{}:{}:{}",
            self.adapter.name(),
            self.definition.name,
            JsonValue::Object(filter.clone()),
            serde_json::to_string(options).unwrap_or_default()
        )
    }

    /// Read rows matching an already compiled filter.
    pub(crate) async fn fetch(
        &self,
        filter: &Record,
        options: &FindOptions,
        cache_ttl: Option<u64>,
    ) -> DbResult<Vec<Record>> {
        let ttl = cache_ttl.or(self.definition.cache_ttl).filter(|t| *t > 0);
        let cache = match (&self.cache, ttl) {
            (Some(cache), Some(ttl)) if !self.adapter.in_transaction() => {
                Some((cache, ttl, self.cache_key(filter, options)))
            }
            _ => None,
        };
        if let Some((cache, _, key)) = &cache {
            if let Some(JsonValue::Array(rows)) = cache.get(key) {
                trace!(model = %self.definition.name, key = %key, "Read cache hit");
                return Ok(rows
                    .into_iter()
                    .filter_map(|row| match row {
                        JsonValue::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect());
            }
        }

        let rows = self.fetch_uncached(filter, options).await?;

        if let Some((cache, ttl, key)) = &cache {
            let value = JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect());
            cache.set(key, value, *ttl);
        }
        Ok(rows)
    }

    async fn fetch_uncached(&self, filter: &Record, options: &FindOptions) -> DbResult<Vec<Record>> {
        let mut options = options.clone();
        if let Some(fields) = options.fields.as_mut() {
            let pk = self.primary_key();
            if !fields.iter().any(|f| f == pk) {
                fields.push(pk.to_string());
            }
        }
        if self.is_document() {
            let filter = self.document_filter(filter);
            return self
                .adapter
                .query(QueryRequest::find(self.table(), filter, options))
                .await;
        }

        let dialect = self.dialect();
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter).from(self.table());
        if let Some(fields) = &options.fields {
            let columns = fields
                .iter()
                .map(|f| quote_identifier(dialect, f))
                .collect::<DbResult<Vec<_>>>()?;
            qb = qb.select(columns);
        }
        if let Some(lowered) = self.lower(self.table(), filter)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        for (field, order) in &options.sort {
            qb = qb.order_by(quote_identifier(dialect, field)?, *order);
        }
        if let Some(limit) = options.limit {
            qb = qb.limit(limit);
        }
        if let Some(skip) = options.skip {
            qb = qb.offset(skip);
        }
        qb.execute().await
    }

    /// Count rows of this model's table matching a compiled filter.
    pub(crate) async fn count_where(&self, filter: &Record) -> DbResult<u64> {
        self.count_in(self.table(), filter).await
    }

    /// Count rows of any table or collection on this model's adapter.
    pub(crate) async fn count_in(&self, table: &str, filter: &Record) -> DbResult<u64> {
        if self.is_document() {
            let filter = if table == self.table() {
                self.document_filter(filter)
            } else {
                filter.clone()
            };
            return self.adapter.count(table, &filter).await;
        }
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter)
            .select(["COUNT(*) AS total"])
            .from(table);
        if let Some(lowered) = self.lower(table, filter)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        let row = qb.execute_one().await?;
        Ok(row
            .as_ref()
            .and_then(|r| r.get("total"))
            .map_or(0, json_to_u64))
    }

    pub(crate) async fn distinct_where(&self, field: &str, filter: &Record) -> DbResult<Vec<JsonValue>> {
        if self.is_document() {
            let filter = self.document_filter(filter);
            return self.adapter.distinct(self.table(), field, &filter).await;
        }
        let column = quote_identifier(self.dialect(), field)?;
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter)
            .select([format!("DISTINCT {}", column)])
            .from(self.table());
        if let Some(lowered) = self.lower(self.table(), filter)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        let rows = qb.execute().await?;
        Ok(rows
            .into_iter()
            .map(|mut row| row.remove(field).unwrap_or(JsonValue::Null))
            .collect())
    }

    pub(crate) async fn aggregate_where(&self, filter: &Record, pipeline: Vec<Record>) -> DbResult<Vec<Record>> {
        if !self.is_document() {
            return Err(DbError::invalid_input(format!(
                "Aggregation pipelines require the document backend, not {}",
                self.adapter.backend()
            )));
        }
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        if !filter.is_empty() {
            stages.push(single("$match", JsonValue::Object(self.document_filter(filter))));
        }
        stages.extend(pipeline);
        self.adapter.aggregate(self.table(), &stages).await
    }

    /// Insert and return the primary key value.
    pub(crate) async fn insert_record(&self, record: &Record) -> DbResult<Option<JsonValue>> {
        let pk = self.primary_key();
        let explicit = record.get(pk).filter(|v| !v.is_null()).cloned();
        if self.is_document() {
            let document = JsonValue::Object(self.document_values(record));
            let result = self
                .adapter
                .execute(ExecuteRequest::document(DocumentOp::Insert, self.table(), document))
                .await?;
            return Ok(explicit.or(result.insert_id));
        }
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter)
            .insert_values(self.table(), self.sql_values(record));
        if self.dialect() == SqlDialect::Postgres {
            qb = qb.returning(pk);
        }
        let result = qb.execute_update().await?;
        Ok(explicit.or(result.insert_id))
    }

    fn is_pk_filter(&self, filter: &Record) -> bool {
        filter.len() == 1
            && filter
                .get(self.primary_key())
                .is_some_and(|v| !v.is_object() && !v.is_array() && !v.is_null())
    }

    /// Narrow a single-row SQL write to the first match's primary key.
    async fn single_target(&self, filter: &Record) -> DbResult<Option<Record>> {
        if self.is_pk_filter(filter) {
            return Ok(Some(filter.clone()));
        }
        let options = FindOptions {
            limit: Some(1),
            fields: Some(vec![self.primary_key().to_string()]),
            ..FindOptions::default()
        };
        let rows = self.fetch_uncached(filter, &options).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|mut row| row.remove(self.primary_key()))
            .map(|id| self.pk_filter(id)))
    }

    /// Set `changes` on the first (or every) row matching a compiled filter.
    pub(crate) async fn update_where(&self, filter: &Record, changes: &Record, many: bool) -> DbResult<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        if self.is_document() {
            let op = if many { DocumentOp::UpdateMany } else { DocumentOp::Update };
            let data = json!({
                "filter": self.document_filter(filter),
                "update": {"$set": self.document_values(changes)},
            });
            let result = self
                .adapter
                .execute(ExecuteRequest::document(op, self.table(), data))
                .await?;
            return Ok(result.matched_count.unwrap_or(result.affected_rows));
        }
        let target = if many {
            filter.clone()
        } else {
            match self.single_target(filter).await? {
                Some(target) => target,
                None => return Ok(0),
            }
        };
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter)
            .update_values(self.table(), self.sql_values(changes));
        if let Some(lowered) = self.lower(self.table(), &target)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        Ok(qb.execute_update().await?.affected_rows)
    }

    /// Add `amount` to `field`; a missing or null value counts as zero.
    pub(crate) async fn increment_where(
        &self,
        filter: &Record,
        field: &str,
        amount: i64,
        many: bool,
    ) -> DbResult<u64> {
        if self.definition.is_virtual(field) {
            return Err(DbError::invalid_input(format!("Cannot increment virtual field '{}'", field)));
        }
        let mut touched = Record::new();
        if let Some(ts) = &self.definition.timestamps {
            touched.insert(ts.updated_at.clone(), now_value());
        }
        if self.is_document() {
            let op = if many { DocumentOp::UpdateMany } else { DocumentOp::Update };
            let mut update = single("$inc", JsonValue::Object(single(field, json!(amount))));
            if !touched.is_empty() {
                update.insert("$set".into(), JsonValue::Object(self.document_values(&touched)));
            }
            let data = json!({
                "filter": self.document_filter(filter),
                "update": update,
            });
            let result = self
                .adapter
                .execute(ExecuteRequest::document(op, self.table(), data))
                .await?;
            return Ok(result.matched_count.unwrap_or(result.affected_rows));
        }
        let target = if many {
            filter.clone()
        } else {
            match self.single_target(filter).await? {
                Some(target) => target,
                None => return Ok(0),
            }
        };
        let column = quote_identifier(self.dialect(), field)?;
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter)
            .update_values(self.table(), self.sql_values(&touched))
            .set_raw(
                format!("{col} = COALESCE({col}, 0) + ?", col = column),
                vec![QueryParam::Int(amount)],
            );
        if let Some(lowered) = self.lower(self.table(), &target)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        Ok(qb.execute_update().await?.affected_rows)
    }

    /// Remove the first (or every) row matching a compiled filter.
    pub(crate) async fn delete_where(&self, filter: &Record, many: bool) -> DbResult<u64> {
        if self.is_document() {
            let op = if many { DocumentOp::DeleteMany } else { DocumentOp::Delete };
            let data = json!({ "filter": self.document_filter(filter) });
            let result = self
                .adapter
                .execute(ExecuteRequest::document(op, self.table(), data))
                .await?;
            return Ok(result.affected_rows);
        }
        let target = if many {
            filter.clone()
        } else {
            match self.single_target(filter).await? {
                Some(target) => target,
                None => return Ok(0),
            }
        };
        let mut qb = SqlQueryBuilder::for_adapter(&self.adapter).delete(self.table());
        if let Some(lowered) = self.lower(self.table(), &target)? {
            qb = qb.where_(lowered.sql, lowered.params);
        }
        Ok(qb.execute_update().await?.affected_rows)
    }

    /// Native find-one-and-modify on the document backend.
    pub(crate) async fn find_one_and(
        &self,
        op: DocumentOp,
        filter: &Record,
        options: &FindOptions,
        payload: Option<(&str, JsonValue)>,
    ) -> DbResult<Option<Record>> {
        let mut data = single("filter", JsonValue::Object(self.document_filter(filter)));
        if !options.sort.is_empty() {
            let sort: Record = options
                .sort
                .iter()
                .map(|(f, o)| (f.clone(), json!(o.as_i32())))
                .collect();
            data.insert("sort".into(), JsonValue::Object(sort));
        }
        if let Some((key, value)) = payload {
            data.insert(key.to_string(), value);
        }
        let result = self
            .adapter
            .execute(ExecuteRequest::document(op, self.table(), JsonValue::Object(data)))
            .await?;
        Ok(result.document)
    }

    // Value conversion

    fn lower(&self, table: &str, filter: &Record) -> DbResult<Option<SqlFilter>> {
        let definition = Arc::clone(&self.definition);
        let own = table == definition.table;
        let convert = move |field: &str, value: &JsonValue| {
            if own && definition.is_date_field(field) {
                QueryParam::timestamp_from_json(value)
            } else {
                QueryParam::from(value)
            }
        };
        lower_filter(filter, self.dialect(), &convert)
    }

    pub(crate) fn sql_values(&self, record: &Record) -> Vec<(String, QueryParam)> {
        record
            .iter()
            .filter(|(k, _)| !self.definition.is_virtual(k))
            .map(|(k, v)| {
                let param = if self.definition.is_date_field(k) {
                    QueryParam::timestamp_from_json(v)
                } else {
                    QueryParam::from(v)
                };
                (k.clone(), param)
            })
            .collect()
    }

    /// Date strings become `{"$date": ...}` so they are stored as BSON dates.
    pub(crate) fn document_values(&self, record: &Record) -> Record {
        record
            .iter()
            .filter(|(k, _)| !self.definition.is_virtual(k))
            .map(|(k, v)| {
                let value = if self.definition.is_date_field(k) {
                    date_operand(v)
                } else {
                    v.clone()
                };
                (k.clone(), value)
            })
            .collect()
    }

    /// Apply the date conversion to comparison operands of date fields.
    pub(crate) fn document_filter(&self, filter: &Record) -> Record {
        filter
            .iter()
            .map(|(k, v)| {
                let value = match k.as_str() {
                    "$and" | "$or" | "$nor" => match v {
                        JsonValue::Array(items) => JsonValue::Array(
                            items
                                .iter()
                                .map(|item| match item {
                                    JsonValue::Object(sub) => JsonValue::Object(self.document_filter(sub)),
                                    other => other.clone(),
                                })
                                .collect(),
                        ),
                        other => other.clone(),
                    },
                    field if self.definition.is_date_field(field) => date_condition(v),
                    _ => v.clone(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

fn date_operand(value: &JsonValue) -> JsonValue {
    match value.as_str().and_then(parse_datetime) {
        Some(dt) => json!({"$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true)}),
        None => value.clone(),
    }
}

fn date_condition(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => JsonValue::Object(
            ops.iter()
                .map(|(op, operand)| {
                    let operand = match (op.as_str(), operand) {
                        ("$in" | "$nin", JsonValue::Array(items)) => {
                            JsonValue::Array(items.iter().map(date_operand).collect())
                        }
                        ("$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte", v) => date_operand(v),
                        ("$not", v) => date_condition(v),
                        (_, v) => v.clone(),
                    };
                    (op.clone(), operand)
                })
                .collect(),
        ),
        other => date_operand(other),
    }
}
