//! MongoDB backend.
//!
//! Wraps one `mongodb::Client` plus the configured database. In-flight
//! operations are bounded by a semaphore sized like the driver pool, so the
//! backend can report a `PoolState` and fail with "pool exhausted" after the
//! acquire timeout the same way the SQL pools do.

use crate::config::{ConnectionConfig, DatabaseType};
use crate::db::pool::{PoolState, connection_suggestion};
use crate::db::transaction::DbTransaction;
use crate::db::value::{DocumentOp, ExecuteResult, FindOptions, IndexSpec, Record, parse_datetime};
use crate::error::{DbError, DbResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bson::{Bson, Document, doc, oid::ObjectId};
use futures_util::TryStreamExt;
use mongodb::options::{
    ClientOptions, FindOneAndDeleteOptions, FindOneAndReplaceOptions, FindOneAndUpdateOptions,
    FindOptions as MongoFindOptions, IndexOptions, ReplaceOptions, ReturnDocument, UpdateOptions,
};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info};

/// Run a driver action with or without an explicit session.
macro_rules! run_action {
    ($action:expr, $session:expr) => {
        match $session {
            Some(session) => $action.session(&mut *session).await,
            None => $action.await,
        }
    };
}

/// Collect a find/aggregate cursor with or without an explicit session.
macro_rules! collect_cursor {
    ($action:expr, $session:expr) => {
        match $session {
            Some(session) => {
                let mut cursor = $action.session(&mut *session).await?;
                let mut docs = Vec::new();
                while let Some(doc) = cursor.next(&mut *session).await {
                    docs.push(doc?);
                }
                docs
            }
            None => $action.await?.try_collect::<Vec<Document>>().await?,
        }
    };
}

/// MongoDB client wrapper.
#[derive(Debug, Clone)]
pub struct DocumentBackend {
    client: Client,
    database: Database,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
    query_timeout: Duration,
    timezone: Option<String>,
}

impl DocumentBackend {
    /// Build the client and verify the server answers a ping.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let url = config.connection_url()?;
        let pool = &config.pool;
        let opts = &config.options;

        let mut client_options = ClientOptions::parse(url.as_str()).await.map_err(|e| {
            DbError::connection_caused_by(
                format!("Invalid MongoDB connection string: {}", e),
                "Check the connection string format",
                e,
            )
        })?;

        let max_connections = pool.max_connections_or_default(false);
        let min_connections = pool.min_connections_or_default().min(max_connections);
        client_options.max_pool_size = Some(max_connections);
        client_options.min_pool_size = Some(min_connections);
        client_options.max_idle_time = Some(Duration::from_secs(pool.idle_timeout_or_default()));
        client_options.connect_timeout = Some(opts.connect_timeout_or_default());
        client_options.server_selection_timeout = Some(opts.server_selection_timeout_or_default());
        if let Some(replica_set) = &opts.replica_set {
            client_options.repl_set_name = Some(replica_set.clone());
        }
        if let Some(direct) = opts.direct_connection {
            client_options.direct_connection = Some(direct);
        }
        if let Some(app_name) = &opts.app_name {
            client_options.app_name = Some(app_name.clone());
        }

        let client = Client::with_options(client_options)?;
        let database = client.database(&config.database_name());

        let connect_timeout = opts.connect_timeout_or_default();
        let ping = async { database.run_command(doc! { "ping": 1 }).await };
        match timeout(connect_timeout, ping).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let suggestion = connection_suggestion(DatabaseType::MongoDB, &e);
                return Err(DbError::connection_caused_by(
                    format!("Failed to connect to MongoDB: {}", e),
                    suggestion,
                    e,
                ));
            }
            Err(_) => {
                return Err(DbError::connection(
                    format!(
                        "Connection timed out after {} seconds",
                        connect_timeout.as_secs()
                    ),
                    "Check that the MongoDB server is reachable and increase connect_timeout_secs if needed",
                ));
            }
        }

        info!(
            database = %database.name(),
            max_connections,
            "MongoDB client connected"
        );

        Ok(Self {
            client,
            database,
            permits: Arc::new(Semaphore::new(max_connections as usize)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_connections,
            min_connections,
            acquire_timeout: Duration::from_secs(pool.acquire_timeout_or_default()),
            query_timeout: opts.query_timeout_or_default(),
            timezone: opts.timezone.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Timezone configured for date output.
    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }

    /// Occupancy snapshot derived from the permit count.
    pub fn pool_state(&self) -> PoolState {
        let available = self.permits.available_permits() as u32;
        let active = self.max_connections.saturating_sub(available);
        let total = active.max(self.min_connections);
        PoolState::from_counts(
            total,
            total - active,
            self.waiting.load(Ordering::SeqCst),
            self.max_connections,
        )
    }

    /// Hold a permit and apply the query timeout for one operation.
    async fn guarded<T, F>(&self, operation: &str, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let permit = {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let acquired = timeout(self.acquire_timeout, self.permits.acquire()).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DbError::not_connected()),
                Err(_) => return Err(DbError::pool_exhausted()),
            }
        };

        let result = match timeout(self.query_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(
                operation,
                self.query_timeout.as_millis() as u64,
            )),
        };
        drop(permit);
        result
    }

    pub async fn ping(&self) -> DbResult<()> {
        self.guarded("ping", async {
            self.database.run_command(doc! { "ping": 1 }).await?;
            Ok(())
        })
        .await
    }

    /// Start a session and open a transaction on it.
    pub async fn begin(&self) -> DbResult<DbTransaction> {
        if self.permits.is_closed() {
            return Err(DbError::not_connected());
        }
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(DbTransaction::Document(session))
    }

    /// Refuse new operations and shut the client down.
    pub async fn close(&self) {
        self.permits.close();
        self.client.clone().shutdown().await;
        debug!(database = %self.database.name(), "MongoDB client closed");
    }

    pub async fn find(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: &Record,
        options: &FindOptions,
    ) -> DbResult<Vec<Record>> {
        let filter = to_document(filter)?;
        let opts = find_options(options);
        let coll = self.collection(collection);
        self.guarded("find", async move {
            let docs = collect_cursor!(coll.find(filter).with_options(opts), session);
            Ok(docs.iter().map(document_to_record).collect())
        })
        .await
    }

    pub async fn count(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: &Record,
    ) -> DbResult<u64> {
        let filter = to_document(filter)?;
        let coll = self.collection(collection);
        self.guarded("count", async move {
            Ok(run_action!(coll.count_documents(filter), session)?)
        })
        .await
    }

    pub async fn distinct(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        field: &str,
        filter: &Record,
    ) -> DbResult<Vec<JsonValue>> {
        let filter = to_document(filter)?;
        let coll = self.collection(collection);
        self.guarded("distinct", async move {
            let values = run_action!(coll.distinct(field, filter), session)?;
            Ok(values.into_iter().map(bson_to_json).collect())
        })
        .await
    }

    pub async fn aggregate(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        pipeline: &[Record],
    ) -> DbResult<Vec<Record>> {
        let pipeline = pipeline
            .iter()
            .map(to_document)
            .collect::<DbResult<Vec<_>>>()?;
        let coll = self.collection(collection);
        self.guarded("aggregate", async move {
            let docs = collect_cursor!(coll.aggregate(pipeline), session);
            Ok(docs.iter().map(document_to_record).collect())
        })
        .await
    }

    /// Dispatch one write operation. See `ExecuteRequest::Document` for the
    /// `data` shapes.
    pub async fn execute(
        &self,
        session: Option<&mut ClientSession>,
        op: DocumentOp,
        collection: &str,
        data: &JsonValue,
    ) -> DbResult<ExecuteResult> {
        let coll = self.collection(collection);
        let write = WriteArgs::parse(op, data)?;
        self.guarded(op.as_str(), async move {
            match write {
                WriteArgs::Insert(document) => {
                    let r = run_action!(coll.insert_one(document), session)?;
                    let id = bson_to_json(r.inserted_id);
                    Ok(ExecuteResult {
                        affected_rows: 1,
                        insert_id: Some(id.clone()),
                        inserted_ids: vec![id],
                        ..ExecuteResult::default()
                    })
                }
                WriteArgs::InsertMany(documents) => {
                    let r = run_action!(coll.insert_many(documents), session)?;
                    let mut ids: Vec<(usize, Bson)> = r.inserted_ids.into_iter().collect();
                    ids.sort_by_key(|(idx, _)| *idx);
                    let inserted_ids: Vec<JsonValue> =
                        ids.into_iter().map(|(_, id)| bson_to_json(id)).collect();
                    Ok(ExecuteResult {
                        affected_rows: inserted_ids.len() as u64,
                        inserted_ids,
                        ..ExecuteResult::default()
                    })
                }
                WriteArgs::Update {
                    filter,
                    update,
                    upsert,
                    many,
                } => {
                    let mut opts = UpdateOptions::default();
                    opts.upsert = Some(upsert);
                    let r = if many {
                        run_action!(coll.update_many(filter, update).with_options(opts), session)?
                    } else {
                        run_action!(coll.update_one(filter, update).with_options(opts), session)?
                    };
                    Ok(ExecuteResult {
                        affected_rows: r.modified_count,
                        matched_count: Some(r.matched_count),
                        upserted_id: r.upserted_id.map(bson_to_json),
                        ..ExecuteResult::default()
                    })
                }
                WriteArgs::Replace {
                    filter,
                    replacement,
                    upsert,
                } => {
                    let mut opts = ReplaceOptions::default();
                    opts.upsert = Some(upsert);
                    let r = run_action!(
                        coll.replace_one(filter, replacement).with_options(opts),
                        session
                    )?;
                    Ok(ExecuteResult {
                        affected_rows: r.modified_count,
                        matched_count: Some(r.matched_count),
                        upserted_id: r.upserted_id.map(bson_to_json),
                        ..ExecuteResult::default()
                    })
                }
                WriteArgs::Delete { filter, many } => {
                    let r = if many {
                        run_action!(coll.delete_many(filter), session)?
                    } else {
                        run_action!(coll.delete_one(filter), session)?
                    };
                    Ok(ExecuteResult {
                        affected_rows: r.deleted_count,
                        ..ExecuteResult::default()
                    })
                }
                WriteArgs::FindOneAndUpdate {
                    filter,
                    update,
                    sort,
                    return_new,
                    upsert,
                } => {
                    let mut opts = FindOneAndUpdateOptions::default();
                    opts.sort = sort;
                    opts.upsert = Some(upsert);
                    opts.return_document = Some(return_document(return_new));
                    let found = run_action!(
                        coll.find_one_and_update(filter, update).with_options(opts),
                        session
                    )?;
                    Ok(found_result(found))
                }
                WriteArgs::FindOneAndReplace {
                    filter,
                    replacement,
                    sort,
                    return_new,
                    upsert,
                } => {
                    let mut opts = FindOneAndReplaceOptions::default();
                    opts.sort = sort;
                    opts.upsert = Some(upsert);
                    opts.return_document = Some(return_document(return_new));
                    let found = run_action!(
                        coll.find_one_and_replace(filter, replacement)
                            .with_options(opts),
                        session
                    )?;
                    Ok(found_result(found))
                }
                WriteArgs::FindOneAndDelete { filter, sort } => {
                    let mut opts = FindOneAndDeleteOptions::default();
                    opts.sort = sort;
                    let found = run_action!(
                        coll.find_one_and_delete(filter).with_options(opts),
                        session
                    )?;
                    Ok(found_result(found))
                }
            }
        })
        .await
    }

    pub async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        if spec.fields.is_empty() {
            return Err(DbError::invalid_input(format!(
                "Index '{}' must name at least one field",
                spec.name
            )));
        }
        let mut keys = Document::new();
        for (field, order) in &spec.fields {
            keys.insert(field.clone(), order.as_i32());
        }
        let mut options = IndexOptions::default();
        options.name = Some(spec.name.clone());
        options.unique = Some(spec.unique);
        let model = IndexModel::builder().keys(keys).options(options).build();
        let coll = self.collection(&spec.table);
        self.guarded("createIndex", async move {
            coll.create_index(model).await?;
            Ok(())
        })
        .await
    }

    pub async fn drop_index(&self, collection: &str, name: &str) -> DbResult<()> {
        let coll = self.collection(collection);
        self.guarded("dropIndex", async move {
            coll.drop_index(name).await?;
            Ok(())
        })
        .await
    }
}

/// Parsed arguments of a document write.
#[derive(Debug)]
enum WriteArgs {
    Insert(Document),
    InsertMany(Vec<Document>),
    Update {
        filter: Document,
        update: Document,
        upsert: bool,
        many: bool,
    },
    Replace {
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    Delete {
        filter: Document,
        many: bool,
    },
    FindOneAndUpdate {
        filter: Document,
        update: Document,
        sort: Option<Document>,
        return_new: bool,
        upsert: bool,
    },
    FindOneAndReplace {
        filter: Document,
        replacement: Document,
        sort: Option<Document>,
        return_new: bool,
        upsert: bool,
    },
    FindOneAndDelete {
        filter: Document,
        sort: Option<Document>,
    },
}

impl WriteArgs {
    fn parse(op: DocumentOp, data: &JsonValue) -> DbResult<Self> {
        Ok(match op {
            DocumentOp::Insert => Self::Insert(to_document(as_object(data, "document")?)?),
            DocumentOp::InsertMany => {
                let items = data.as_array().ok_or_else(|| {
                    DbError::invalid_input("insertMany expects an array of documents")
                })?;
                if items.is_empty() {
                    return Err(DbError::invalid_input(
                        "insertMany requires at least one document",
                    ));
                }
                Self::InsertMany(
                    items
                        .iter()
                        .map(|item| to_document(as_object(item, "document")?))
                        .collect::<DbResult<_>>()?,
                )
            }
            DocumentOp::Update | DocumentOp::UpdateMany => Self::Update {
                filter: filter_arg(data)?,
                update: update_arg(data)?,
                upsert: bool_arg(data, "upsert", false),
                many: op == DocumentOp::UpdateMany,
            },
            DocumentOp::Replace => Self::Replace {
                filter: filter_arg(data)?,
                replacement: replacement_arg(data)?,
                upsert: bool_arg(data, "upsert", false),
            },
            DocumentOp::Delete | DocumentOp::DeleteMany => Self::Delete {
                filter: filter_arg(data)?,
                many: op == DocumentOp::DeleteMany,
            },
            DocumentOp::FindOneAndUpdate => Self::FindOneAndUpdate {
                filter: filter_arg(data)?,
                update: update_arg(data)?,
                sort: sort_arg(data)?,
                return_new: bool_arg(data, "returnNew", true),
                upsert: bool_arg(data, "upsert", false),
            },
            DocumentOp::FindOneAndReplace => Self::FindOneAndReplace {
                filter: filter_arg(data)?,
                replacement: replacement_arg(data)?,
                sort: sort_arg(data)?,
                return_new: bool_arg(data, "returnNew", true),
                upsert: bool_arg(data, "upsert", false),
            },
            DocumentOp::FindOneAndDelete => Self::FindOneAndDelete {
                filter: filter_arg(data)?,
                sort: sort_arg(data)?,
            },
        })
    }
}

fn as_object<'a>(value: &'a JsonValue, what: &str) -> DbResult<&'a Record> {
    value
        .as_object()
        .ok_or_else(|| DbError::invalid_input(format!("Expected {} to be an object", what)))
}

fn filter_arg(data: &JsonValue) -> DbResult<Document> {
    match data.get("filter") {
        None | Some(JsonValue::Null) => Ok(Document::new()),
        Some(filter) => to_document(as_object(filter, "filter")?),
    }
}

/// The update document. Plain field maps are wrapped in `$set`.
fn update_arg(data: &JsonValue) -> DbResult<Document> {
    let update = data
        .get("update")
        .ok_or_else(|| DbError::invalid_input("Missing 'update' document"))?;
    let update = to_document(as_object(update, "update")?)?;
    if update.is_empty() {
        return Err(DbError::invalid_input("Update document must not be empty"));
    }
    if update.keys().any(|k| k.starts_with('$')) {
        Ok(update)
    } else {
        Ok(doc! { "$set": update })
    }
}

fn replacement_arg(data: &JsonValue) -> DbResult<Document> {
    let replacement = data
        .get("replacement")
        .ok_or_else(|| DbError::invalid_input("Missing 'replacement' document"))?;
    let replacement = to_document(as_object(replacement, "replacement")?)?;
    if replacement.keys().any(|k| k.starts_with('$')) {
        return Err(DbError::invalid_input(
            "Replacement document must not contain update operators",
        ));
    }
    Ok(replacement)
}

fn sort_arg(data: &JsonValue) -> DbResult<Option<Document>> {
    let Some(sort) = data.get("sort").and_then(JsonValue::as_object) else {
        return Ok(None);
    };
    let mut doc = Document::new();
    for (field, direction) in sort {
        let order = match direction {
            JsonValue::Number(n) if n.as_i64() == Some(-1) => -1,
            JsonValue::Number(_) => 1,
            JsonValue::String(s) => s.parse::<crate::db::value::SortOrder>()?.as_i32(),
            other => {
                return Err(DbError::invalid_input(format!(
                    "Invalid sort direction for '{}': {}",
                    field, other
                )));
            }
        };
        doc.insert(field.clone(), order);
    }
    Ok(Some(doc))
}

fn bool_arg(data: &JsonValue, key: &str, default: bool) -> bool {
    data.get(key).and_then(JsonValue::as_bool).unwrap_or(default)
}

fn return_document(return_new: bool) -> ReturnDocument {
    if return_new {
        ReturnDocument::After
    } else {
        ReturnDocument::Before
    }
}

fn found_result(found: Option<Document>) -> ExecuteResult {
    ExecuteResult {
        affected_rows: u64::from(found.is_some()),
        document: found.as_ref().map(document_to_record),
        ..ExecuteResult::default()
    }
}

fn find_options(options: &FindOptions) -> MongoFindOptions {
    let mut opts = MongoFindOptions::default();
    if !options.sort.is_empty() {
        let mut sort = Document::new();
        for (field, order) in &options.sort {
            sort.insert(field.clone(), order.as_i32());
        }
        opts.sort = Some(sort);
    }
    opts.limit = options.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
    opts.skip = options.skip;
    if let Some(fields) = &options.fields {
        let mut projection = Document::new();
        for field in fields {
            projection.insert(field.clone(), 1);
        }
        opts.projection = Some(projection);
    }
    opts
}

/// Convert a JSON object into a BSON document.
///
/// `{"$oid": hex}` and `{"$date": rfc3339 | millis}` become native values, and
/// strings under `_id` that parse as an ObjectId are converted.
pub fn to_document(record: &Record) -> DbResult<Document> {
    let mut doc = Document::new();
    for (key, value) in record {
        let bson = json_to_bson(value)?;
        doc.insert(key.clone(), if key == "_id" { coerce_object_ids(bson) } else { bson });
    }
    Ok(doc)
}

pub fn json_to_bson(value: &JsonValue) -> DbResult<Bson> {
    Ok(match value {
        JsonValue::Null => Bson::Null,
        JsonValue::Bool(b) => Bson::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => match i32::try_from(i) {
                Ok(small) => Bson::Int32(small),
                Err(_) => Bson::Int64(i),
            },
            None => Bson::Double(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => Bson::String(s.clone()),
        JsonValue::Array(items) => Bson::Array(
            items
                .iter()
                .map(json_to_bson)
                .collect::<DbResult<Vec<_>>>()?,
        ),
        JsonValue::Object(map) => {
            if map.len() == 1 {
                if let Some(special) = extended_value(map)? {
                    return Ok(special);
                }
            }
            Bson::Document(to_document(map)?)
        }
    })
}

fn extended_value(map: &Record) -> DbResult<Option<Bson>> {
    if let Some(oid) = map.get("$oid").and_then(JsonValue::as_str) {
        return ObjectId::parse_str(oid)
            .map(|id| Some(Bson::ObjectId(id)))
            .map_err(|_| DbError::invalid_input(format!("Invalid ObjectId: {}", oid)));
    }
    match map.get("$date") {
        Some(JsonValue::String(s)) => parse_datetime(s)
            .map(|dt| Some(Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis()))))
            .ok_or_else(|| DbError::invalid_input(format!("Invalid date: {}", s))),
        Some(JsonValue::Number(n)) => Ok(n
            .as_i64()
            .map(|ms| Bson::DateTime(bson::DateTime::from_millis(ms)))),
        _ => Ok(None),
    }
}

/// Turn hex strings into ObjectIds inside an `_id` value, including operator
/// documents such as `{"$in": [...]}`.
fn coerce_object_ids(value: Bson) -> Bson {
    match value {
        Bson::String(s) => match ObjectId::parse_str(&s) {
            Ok(id) => Bson::ObjectId(id),
            Err(_) => Bson::String(s),
        },
        Bson::Array(items) => Bson::Array(items.into_iter().map(coerce_object_ids).collect()),
        Bson::Document(doc) if doc.keys().all(|k| k.starts_with('$')) => Bson::Document(
            doc.into_iter()
                .map(|(k, v)| (k, coerce_object_ids(v)))
                .collect(),
        ),
        other => other,
    }
}

pub fn document_to_record(doc: &Document) -> Record {
    doc.iter()
        .map(|(k, v)| (k.clone(), bson_to_json(v.clone())))
        .collect()
}

/// Convert BSON to plain JSON: ObjectIds become hex strings, dates RFC 3339
/// strings and binaries base64.
pub fn bson_to_json(value: Bson) -> JsonValue {
    match value {
        Bson::Null | Bson::Undefined => JsonValue::Null,
        Bson::Boolean(b) => JsonValue::Bool(b),
        Bson::Int32(i) => JsonValue::from(i),
        Bson::Int64(i) => JsonValue::from(i),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Bson::String(s) => JsonValue::String(s),
        Bson::ObjectId(id) => JsonValue::String(id.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => JsonValue::String(s),
            Err(_) => JsonValue::from(dt.timestamp_millis()),
        },
        Bson::Binary(bin) => JsonValue::String(STANDARD.encode(&bin.bytes)),
        Bson::Array(items) => JsonValue::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(doc) => JsonValue::Object(document_to_record(&doc)),
        other => other.into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::SortOrder;
    use serde_json::json;

    fn obj(value: JsonValue) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_to_document_numbers_and_nesting() {
        let doc = to_document(&obj(json!({
            "small": 5,
            "big": 5_000_000_000i64,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": {"ok": true}
        })))
        .unwrap();
        assert_eq!(doc.get("small"), Some(&Bson::Int32(5)));
        assert_eq!(doc.get("big"), Some(&Bson::Int64(5_000_000_000)));
        assert_eq!(doc.get("ratio"), Some(&Bson::Double(0.5)));
        assert!(doc.get_document("nested").unwrap().get_bool("ok").unwrap());
    }

    #[test]
    fn test_id_strings_become_object_ids() {
        let hex = "65f0c0ffee0123456789abcd";
        let doc = to_document(&obj(json!({"_id": hex}))).unwrap();
        assert_eq!(doc.get_object_id("_id").unwrap().to_hex(), hex);

        let doc = to_document(&obj(json!({"_id": {"$in": [hex, "plain"]}}))).unwrap();
        let ids = doc.get_document("_id").unwrap().get_array("$in").unwrap();
        assert!(matches!(ids[0], Bson::ObjectId(_)));
        assert_eq!(ids[1], Bson::String("plain".into()));

        // Other fields keep their strings.
        let doc = to_document(&obj(json!({"ref": hex}))).unwrap();
        assert_eq!(doc.get_str("ref").unwrap(), hex);
    }

    #[test]
    fn test_extended_dates() {
        let doc = to_document(&obj(json!({"at": {"$date": "2024-03-01T10:00:00Z"}}))).unwrap();
        let dt = doc.get_datetime("at").unwrap();
        assert_eq!(dt.timestamp_millis(), 1_709_287_200_000);

        assert!(to_document(&obj(json!({"at": {"$date": "nope"}}))).is_err());
    }

    #[test]
    fn test_operator_documents_pass_through() {
        let doc = to_document(&obj(json!({"age": {"$gte": 18}, "name": {"$regex": "ab", "$options": "i"}})))
            .unwrap();
        assert_eq!(doc.get_document("age").unwrap().get_i32("$gte").unwrap(), 18);
        assert_eq!(doc.get_document("name").unwrap().get_str("$options").unwrap(), "i");
    }

    #[test]
    fn test_bson_to_json() {
        let id = ObjectId::new();
        let doc = doc! {
            "_id": id,
            "at": bson::DateTime::from_millis(0),
            "n": 3i64,
            "items": [1, "x"],
        };
        let record = document_to_record(&doc);
        assert_eq!(record["_id"], json!(id.to_hex()));
        assert_eq!(record["at"], json!("1970-01-01T00:00:00Z"));
        assert_eq!(record["n"], json!(3));
        assert_eq!(record["items"], json!([1, "x"]));
    }

    #[test]
    fn test_update_arg_wraps_plain_fields() {
        let update = update_arg(&json!({"update": {"status": "done"}})).unwrap();
        assert_eq!(update, doc! {"$set": {"status": "done"}});

        let update = update_arg(&json!({"update": {"$inc": {"n": 1}}})).unwrap();
        assert_eq!(update, doc! {"$inc": {"n": 1}});

        assert!(update_arg(&json!({"filter": {}})).is_err());
        assert!(update_arg(&json!({"update": {}})).is_err());
    }

    #[test]
    fn test_write_args_parse() {
        let args = WriteArgs::parse(DocumentOp::InsertMany, &json!([{"a": 1}, {"a": 2}])).unwrap();
        assert!(matches!(args, WriteArgs::InsertMany(ref docs) if docs.len() == 2));

        assert!(WriteArgs::parse(DocumentOp::InsertMany, &json!([])).is_err());
        assert!(WriteArgs::parse(DocumentOp::Insert, &json!([1])).is_err());
        assert!(
            WriteArgs::parse(
                DocumentOp::Replace,
                &json!({"filter": {}, "replacement": {"$set": {"a": 1}}})
            )
            .is_err()
        );

        match WriteArgs::parse(
            DocumentOp::FindOneAndUpdate,
            &json!({"filter": {"a": 1}, "update": {"b": 2}, "sort": {"a": "desc"}, "returnNew": false}),
        )
        .unwrap()
        {
            WriteArgs::FindOneAndUpdate {
                sort, return_new, ..
            } => {
                assert_eq!(sort, Some(doc! {"a": -1}));
                assert!(!return_new);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_find_options() {
        let opts = find_options(&FindOptions {
            sort: vec![("age".into(), SortOrder::Desc)],
            limit: Some(10),
            skip: Some(5),
            fields: Some(vec!["name".into()]),
        });
        assert_eq!(opts.sort, Some(doc! {"age": -1}));
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.skip, Some(5));
        assert_eq!(opts.projection, Some(doc! {"name": 1}));
    }
}
