//! Schema validation.
//!
//! Rules run per field in a fixed order and stop at the first failure, so
//! each field reports at most one error. Every field is evaluated and the
//! failures are returned together as one `DbError::Validation`.

use crate::db::value::Record;
use crate::error::{DbError, DbResult};
use crate::i18n::interpolate;
use crate::model::engine::Model;
use crate::model::schema::FieldDef;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

/// Validation rule identifiers, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Required,
    Type,
    Format,
    Pattern,
    Min,
    Max,
    MinLength,
    MaxLength,
    Enum,
    Array,
    ArrayItem,
    Equals,
    NotEquals,
    Compare,
    Custom,
    Unique,
    Exists,
    NotExists,
    RequiredWhen,
    Async,
}

impl Rule {
    /// Message catalog key suffix (`validation.<key>`).
    pub fn key(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Type => "type",
            Self::Format => "format",
            Self::Pattern => "pattern",
            Self::Min => "min",
            Self::Max => "max",
            Self::MinLength => "min_length",
            Self::MaxLength => "max_length",
            Self::Enum => "enum",
            Self::Array => "array",
            Self::ArrayItem => "array_item",
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Compare => "compare",
            Self::Custom => "custom",
            Self::Unique => "unique",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::RequiredWhen => "required_when",
            Self::Async => "async",
        }
    }
}

/// One failed field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub rule: Rule,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, rule: Rule, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule,
            message: message.into(),
        }
    }
}

/// All failed fields of one validation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// The error reported for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&FieldError> {
        self.0.iter().find(|e| e.field == field)
    }

    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.field.as_str()).collect()
    }

    pub fn into_inner(self) -> Vec<FieldError> {
        self.0
    }
}

impl From<Vec<FieldError>> for ValidationErrors {
    fn from(errors: Vec<FieldError>) -> Self {
        Self(errors)
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

/// Invocation context of one validation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    /// Group name (`"create"`, `"update"` or custom).
    pub group: Option<&'a str>,
    /// Only validate fields present in the change set.
    pub partial: bool,
    /// Primary key of the record being updated, excluded from uniqueness checks.
    pub current_id: Option<&'a JsonValue>,
}

type Failure = (Rule, Vec<(&'static str, String)>);

/// Null, missing or the empty string.
pub(crate) fn is_blank(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn display_bound(bound: f64) -> String {
    if bound.fract() == 0.0 && bound.abs() < 1e15 {
        format!("{}", bound as i64)
    } else {
        bound.to_string()
    }
}

/// Length-or-value bounds. Strings and arrays compare their length.
fn check_bounds(def: &FieldDef, value: &JsonValue) -> Option<Failure> {
    let (measure, length) = match value {
        JsonValue::Number(n) => (n.as_f64()?, false),
        JsonValue::String(s) => (s.chars().count() as f64, true),
        JsonValue::Array(items) => (items.len() as f64, true),
        _ => return None,
    };
    if let Some(min) = def.min {
        if measure < min {
            let rule = if length { Rule::MinLength } else { Rule::Min };
            return Some((rule, vec![("min", display_bound(min))]));
        }
    }
    if let Some(max) = def.max {
        if measure > max {
            let rule = if length { Rule::MaxLength } else { Rule::Max };
            return Some((rule, vec![("max", display_bound(max))]));
        }
    }
    None
}

/// Synchronous rules, from type through the custom function.
fn check_value(def: &FieldDef, value: &JsonValue, record: &Record) -> Option<Failure> {
    if let Some(ty) = def.field_type {
        if !ty.matches(value) {
            return Some((Rule::Type, vec![("type", ty.name().to_string())]));
        }
    }
    if let Some(format) = def.format {
        if !value.as_str().is_some_and(|s| format.matches(s)) {
            return Some((Rule::Format, vec![("format", format.name().to_string())]));
        }
    }
    if let Some(pattern) = &def.pattern {
        if !value.as_str().is_some_and(|s| pattern.is_match(s)) {
            return Some((Rule::Pattern, vec![("pattern", pattern.as_str().to_string())]));
        }
    }
    if let Some(failure) = check_bounds(def, value) {
        return Some(failure);
    }
    if let Some(allowed) = &def.enum_values {
        if !allowed.contains(value) {
            let values = allowed.iter().map(display_value).collect::<Vec<_>>().join(", ");
            return Some((Rule::Enum, vec![("values", values)]));
        }
    }
    if let Some(rule) = &def.array {
        let Some(items) = value.as_array() else {
            return Some((Rule::Type, vec![("type", "array".to_string())]));
        };
        let too_few = rule.min_items.is_some_and(|min| items.len() < min);
        let too_many = rule.max_items.is_some_and(|max| items.len() > max);
        if too_few || too_many {
            return Some((
                Rule::Array,
                vec![
                    ("min", rule.min_items.unwrap_or(0).to_string()),
                    ("max", rule.max_items.map_or_else(|| "any".to_string(), |m| m.to_string())),
                ],
            ));
        }
        let out_of_range = items.iter().filter_map(JsonValue::as_f64).any(|n| {
            rule.item_min.is_some_and(|min| n < min) || rule.item_max.is_some_and(|max| n > max)
        });
        if out_of_range {
            return Some((
                Rule::ArrayItem,
                vec![
                    ("min", rule.item_min.map_or_else(|| "-".to_string(), display_bound)),
                    ("max", rule.item_max.map_or_else(|| "-".to_string(), display_bound)),
                ],
            ));
        }
    }
    let other_value = |other: &str| record.get(other).cloned().unwrap_or(JsonValue::Null);
    if let Some(other) = &def.equals {
        if *value != other_value(other) {
            return Some((Rule::Equals, vec![("other", other.clone())]));
        }
    }
    if let Some(other) = &def.not_equals {
        if *value == other_value(other) {
            return Some((Rule::NotEquals, vec![("other", other.clone())]));
        }
    }
    if let Some((other, compare)) = &def.compare {
        if !compare(value, &other_value(other)) {
            return Some((Rule::Compare, vec![("other", other.clone())]));
        }
    }
    if let Some(custom) = &def.custom {
        if !custom(value, record) {
            return Some((Rule::Custom, Vec::new()));
        }
    }
    None
}

fn conditional_requirement(def: &FieldDef, record: &Record) -> Option<Failure> {
    if let Some((other, expected)) = &def.required_when {
        if record.get(other) == Some(expected) {
            return Some((Rule::RequiredWhen, vec![("other", other.clone())]));
        }
    }
    if let Some(predicate) = &def.when {
        if predicate(record) {
            return Some((Rule::RequiredWhen, Vec::new()));
        }
    }
    None
}

fn single(field: &str, value: JsonValue) -> Record {
    let mut filter = Record::new();
    filter.insert(field.to_string(), value);
    filter
}

/// Backend-dependent rules: uniqueness and existence.
async fn check_lookups(
    model: &Model,
    name: &str,
    def: &FieldDef,
    value: &JsonValue,
    ctx: &ValidationContext<'_>,
) -> DbResult<Option<Failure>> {
    if def.unique {
        let mut filter = single(name, value.clone());
        if let Some(id) = ctx.current_id {
            filter.insert(model.primary_key().to_string(), json!({"$ne": id}));
        }
        if model.count_in(model.table(), &filter).await? > 0 {
            return Ok(Some((Rule::Unique, Vec::new())));
        }
    }
    if let Some(reference) = &def.exists_in {
        let filter = single(&reference.field, value.clone());
        if model.count_in(&reference.table, &filter).await? == 0 {
            return Ok(Some((Rule::Exists, vec![("other", reference.table.clone())])));
        }
    }
    if let Some(reference) = &def.not_exists_in {
        let filter = single(&reference.field, value.clone());
        if model.count_in(&reference.table, &filter).await? > 0 {
            return Ok(Some((Rule::NotExists, vec![("other", reference.table.clone())])));
        }
    }
    Ok(None)
}

async fn check_field(
    model: &Model,
    name: &str,
    def: &FieldDef,
    value: Option<&JsonValue>,
    record: &Record,
    ctx: &ValidationContext<'_>,
) -> DbResult<Option<Failure>> {
    if is_blank(value) {
        if def.required {
            return Ok(Some((Rule::Required, Vec::new())));
        }
        return Ok(conditional_requirement(def, record));
    }
    let Some(value) = value else {
        return Ok(None);
    };
    if let Some(failure) = check_value(def, value, record) {
        return Ok(Some(failure));
    }
    if let Some(failure) = check_lookups(model, name, def, value, ctx).await? {
        return Ok(Some(failure));
    }
    if let Some(check) = &def.async_check {
        if !check(value.clone(), record.clone()).await {
            return Ok(Some((Rule::Async, Vec::new())));
        }
    }
    Ok(None)
}

fn render_message(model: &Model, name: &str, def: &FieldDef, failure: Failure) -> FieldError {
    let (rule, mut params) = failure;
    let template = def.messages.get(&rule).cloned().unwrap_or_else(|| {
        model
            .translator()
            .translate(&format!("validation.{}", rule.key()), &model.definition().locale)
    });
    params.insert(0, ("field", name.to_string()));
    FieldError::new(name, rule, interpolate(&template, &params))
}

/// Validate `changes` against the model schema.
///
/// `record` is the full record used for cross-field rules and predicates;
/// for creates it is the same as `changes`.
pub(crate) async fn validate_record(
    model: &Model,
    changes: &Record,
    record: &Record,
    ctx: ValidationContext<'_>,
) -> DbResult<()> {
    let definition = model.definition().clone();
    let mut errors = Vec::new();
    for (name, def) in definition.schema.iter() {
        if !def.applies_to(ctx.group) {
            continue;
        }
        if ctx.partial && !changes.contains_key(name) {
            continue;
        }
        let value = changes.get(name);
        if let Some(failure) = check_field(model, name, def, value, record, &ctx).await? {
            errors.push(render_message(model, name, def, failure));
        }
    }
    if errors.is_empty() {
        return Ok(());
    }
    debug!(
        model = %definition.name,
        fields = ?errors.iter().map(|e| e.field.as_str()).collect::<Vec<_>>(),
        "Validation failed"
    );
    Err(DbError::Validation(errors.into()))
}
