//! Document filter builder.
//!
//! The filter is a list of OR-branches, each an AND-list of fragments:
//! `where_(A).and_where(B).or_where(C).and_where(D)` compiles to
//! `{"$or": [{"$and": [A, B]}, {"$and": [C, D]}]}`.

use crate::db::value::{FindOptions, Record, SortOrder};
use crate::error::{DbError, DbResult};
use serde_json::{Value as JsonValue, json};

/// Values accepted as filter fragments.
pub trait IntoFilter {
    fn into_filter(self) -> Result<Record, String>;
}

impl IntoFilter for Record {
    fn into_filter(self) -> Result<Record, String> {
        Ok(self)
    }
}

impl IntoFilter for JsonValue {
    fn into_filter(self) -> Result<Record, String> {
        match self {
            JsonValue::Object(map) => Ok(map),
            JsonValue::Null => Ok(Record::new()),
            other => Err(format!("Filter must be an object, got {}", other)),
        }
    }
}

/// AND together filters, dropping empty ones.
pub fn and_filters(filters: impl IntoIterator<Item = Record>) -> Record {
    let mut parts: Vec<Record> = filters.into_iter().filter(|f| !f.is_empty()).collect();
    match parts.len() {
        0 => Record::new(),
        1 => parts.remove(0),
        _ => {
            let mut out = Record::new();
            out.insert(
                "$and".into(),
                JsonValue::Array(parts.into_iter().map(JsonValue::Object).collect()),
            );
            out
        }
    }
}

/// Case-insensitive substring match on `value`, unless it already is a
/// pattern fragment.
pub fn like_fragment(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(ref map) if map.contains_key("$regex") => value,
        JsonValue::String(s) => json!({"$regex": regex::escape(&s), "$options": "i"}),
        JsonValue::Number(n) => json!({"$regex": regex::escape(&n.to_string()), "$options": "i"}),
        JsonValue::Bool(b) => json!({"$regex": b.to_string(), "$options": "i"}),
        other => other,
    }
}

fn like_filter(fields: Record) -> Record {
    fields
        .into_iter()
        .map(|(field, value)| (field, like_fragment(value)))
        .collect()
}

/// Fluent builder for document filters and find options.
#[derive(Debug, Clone, Default)]
pub struct DocumentQueryBuilder {
    branches: Vec<Vec<Record>>,
    options: FindOptions,
    as_array: bool,
    cache_ttl: Option<u64>,
    error: Option<String>,
}

impl DocumentQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept(&mut self, cond: impl IntoFilter) -> Option<Record> {
        match cond.into_filter() {
            Ok(filter) => Some(filter),
            Err(e) => {
                self.error.get_or_insert(e);
                None
            }
        }
    }

    fn reset_with(&mut self, filter: Record) {
        self.branches = vec![vec![filter]];
    }

    fn append(&mut self, filter: Record) {
        match self.branches.last_mut() {
            Some(branch) => branch.push(filter),
            None => self.branches.push(vec![filter]),
        }
    }

    /// Reset the filter to a single branch holding `cond`.
    pub fn where_(mut self, cond: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(cond) {
            self.reset_with(filter);
        }
        self
    }

    /// AND `cond` into the most recent branch.
    pub fn and_where(mut self, cond: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(cond) {
            self.append(filter);
        }
        self
    }

    /// Start a new OR branch with `cond`.
    pub fn or_where(mut self, cond: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(cond) {
            self.branches.push(vec![filter]);
        }
        self
    }

    pub fn like(mut self, fields: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(fields) {
            self.reset_with(like_filter(filter));
        }
        self
    }

    pub fn and_like(mut self, fields: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(fields) {
            self.append(like_filter(filter));
        }
        self
    }

    pub fn or_like(mut self, fields: impl IntoFilter) -> Self {
        if let Some(filter) = self.accept(fields) {
            self.branches.push(vec![like_filter(filter)]);
        }
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.options.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Project only these fields.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Return plain records instead of hydrated instances.
    pub fn as_array(mut self) -> Self {
        self.as_array = true;
        self
    }

    /// Cache read results for `ttl_secs`.
    pub fn cache(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl = Some(ttl_secs);
        self
    }

    pub fn is_array(&self) -> bool {
        self.as_array
    }

    pub fn cache_ttl(&self) -> Option<u64> {
        self.cache_ttl
    }

    pub fn options(&self) -> &FindOptions {
        &self.options
    }

    pub fn branches(&self) -> &[Vec<Record>] {
        &self.branches
    }

    /// Compile the branches into one filter document.
    pub fn build_filter(&self) -> DbResult<Record> {
        if let Some(e) = &self.error {
            return Err(DbError::invalid_input(e.clone()));
        }
        let mut rendered: Vec<Record> = self
            .branches
            .iter()
            .map(|branch| and_filters(branch.iter().cloned()))
            .collect();
        Ok(match rendered.len() {
            0 => Record::new(),
            1 => rendered.remove(0),
            _ => {
                let mut out = Record::new();
                out.insert(
                    "$or".into(),
                    JsonValue::Array(rendered.into_iter().map(JsonValue::Object).collect()),
                );
                out
            }
        })
    }
}
