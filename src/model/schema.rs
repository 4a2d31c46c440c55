//! Schema descriptors: field types and validation rules.

use crate::db::value::{Record, parse_datetime};
use crate::model::validation::Rule;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    /// RFC 3339 (or `YYYY-MM-DD[ HH:MM:SS]`) string; rendered in the model
    /// timezone on reads.
    Date,
    Object,
    Array,
    /// 24-character hex string.
    ObjectId,
    Any,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Object => "object",
            Self::Array => "array",
            Self::ObjectId => "objectId",
            Self::Any => "any",
        }
    }

    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Date => value.as_str().and_then(parse_datetime).is_some(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::ObjectId => value
                .as_str()
                .is_some_and(|s| s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())),
            Self::Any => true,
        }
    }
}

/// Built-in string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Email,
    Url,
    Ipv4,
    Uuid,
    /// `YYYY-MM-DD`
    Date,
    /// `HH:MM[:SS]`
    Time,
}

impl Format {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Url => "url",
            Self::Ipv4 => "ipv4",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::Time => "time",
        }
    }

    pub fn matches(&self, s: &str) -> bool {
        match self {
            Self::Email => {
                let mut parts = s.splitn(2, '@');
                match (parts.next(), parts.next()) {
                    (Some(local), Some(domain)) => {
                        !local.is_empty()
                            && !s.chars().any(char::is_whitespace)
                            && !domain.contains('@')
                            && domain
                                .split_once('.')
                                .is_some_and(|(host, tld)| !host.is_empty() && tld.len() >= 2 && !tld.ends_with('.'))
                    }
                    _ => false,
                }
            }
            Self::Url => url::Url::parse(s)
                .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some()),
            Self::Ipv4 => s.parse::<std::net::Ipv4Addr>().is_ok(),
            Self::Uuid => uuid::Uuid::parse_str(s).is_ok() && s.len() == 36,
            Self::Date => chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            Self::Time => {
                chrono::NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()
                    || chrono::NaiveTime::parse_from_str(s, "%H:%M").is_ok()
            }
        }
    }
}

/// Length and per-item bounds for array fields.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArrayRule {
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub item_min: Option<f64>,
    pub item_max: Option<f64>,
}

/// Another table/collection and the field to look a value up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub table: String,
    pub field: String,
}

/// Comparison against another field's value: `(value, other) -> ok`.
pub type CompareFn = Arc<dyn Fn(&JsonValue, &JsonValue) -> bool + Send + Sync>;
/// Synchronous custom check: `(value, record) -> ok`.
pub type CustomFn = Arc<dyn Fn(&JsonValue, &Record) -> bool + Send + Sync>;
/// Predicate over the whole record.
pub type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
/// Asynchronous custom check: `(value, record) -> ok`.
pub type AsyncCheckFn = Arc<dyn Fn(JsonValue, Record) -> BoxFuture<'static, bool> + Send + Sync>;

/// Type and rules for one field.
#[derive(Clone, Default)]
pub struct FieldDef {
    pub field_type: Option<FieldType>,
    pub required: bool,
    pub format: Option<Format>,
    pub pattern: Option<Regex>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub enum_values: Option<Vec<JsonValue>>,
    pub array: Option<ArrayRule>,
    pub equals: Option<String>,
    pub not_equals: Option<String>,
    pub compare: Option<(String, CompareFn)>,
    pub custom: Option<CustomFn>,
    pub unique: bool,
    pub exists_in: Option<Reference>,
    pub not_exists_in: Option<Reference>,
    pub required_when: Option<(String, JsonValue)>,
    pub when: Option<Predicate>,
    pub async_check: Option<AsyncCheckFn>,
    /// Contexts the rules apply in; all contexts when `None`.
    pub groups: Option<Vec<String>>,
    pub messages: HashMap<Rule, String>,
}

impl std::fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("format", &self.format)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .field("min", &self.min)
            .field("max", &self.max)
            .field("enum_values", &self.enum_values)
            .field("unique", &self.unique)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl FieldDef {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Regex the value must match. Invalid patterns are a programming error
    /// and are reported by `ModelDefinition` construction.
    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Minimum numeric value, or minimum length for strings and arrays.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn array(mut self, rule: ArrayRule) -> Self {
        self.array = Some(rule);
        self
    }

    /// Must equal `other` field's value (password confirmation).
    pub fn equals(mut self, other: impl Into<String>) -> Self {
        self.equals = Some(other.into());
        self
    }

    pub fn not_equals(mut self, other: impl Into<String>) -> Self {
        self.not_equals = Some(other.into());
        self
    }

    pub fn compare<F>(mut self, other: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JsonValue, &JsonValue) -> bool + Send + Sync + 'static,
    {
        self.compare = Some((other.into(), Arc::new(f)));
        self
    }

    pub fn custom<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue, &Record) -> bool + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(f));
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn exists_in(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.exists_in = Some(Reference {
            table: table.into(),
            field: field.into(),
        });
        self
    }

    pub fn not_exists_in(mut self, table: impl Into<String>, field: impl Into<String>) -> Self {
        self.not_exists_in = Some(Reference {
            table: table.into(),
            field: field.into(),
        });
        self
    }

    /// Required when `other` equals `value`.
    pub fn required_when(mut self, other: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.required_when = Some((other.into(), value.into()));
        self
    }

    /// Required when `predicate` holds for the record.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.when = Some(Arc::new(predicate));
        self
    }

    pub fn async_check<F>(mut self, f: F) -> Self
    where
        F: Fn(JsonValue, Record) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        self.async_check = Some(Arc::new(f));
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// Override the message for one rule. `{field}` and the rule's
    /// placeholders are interpolated.
    pub fn message(mut self, rule: Rule, message: impl Into<String>) -> Self {
        self.messages.insert(rule, message.into());
        self
    }

    /// Whether the rules apply in `group`.
    pub fn applies_to(&self, group: Option<&str>) -> bool {
        match (&self.groups, group) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(groups), Some(g)) => groups.iter().any(|x| x == g),
        }
    }

    pub fn is_date(&self) -> bool {
        self.field_type == Some(FieldType::Date)
    }
}

/// Ordered field definitions.
#[derive(Debug, Clone, Default)]
pub struct ModelSchema {
    fields: Vec<(String, FieldDef)>,
}

impl ModelSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a field.
    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = def,
            None => self.fields.push((name, def)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.fields.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Names of `Date` fields.
    pub fn date_fields(&self) -> impl Iterator<Item = &str> {
        self.iter().filter(|(_, d)| d.is_date()).map(|(n, _)| n)
    }
}
