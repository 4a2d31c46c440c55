//! Lowering of document filters to SQL conditions.
//!
//! Supports field equality, `null`, `$eq $ne $gt $gte $lt $lte $in $nin
//! $exists $regex $options $not` per field and `$and $or $nor` at any level.
//! Output uses `?` placeholders; the SQL builder renumbers them for
//! PostgreSQL.

use crate::db::value::{QueryParam, Record};
use crate::error::{DbError, DbResult};
use crate::query::sql::{SqlDialect, quote_identifier};
use serde_json::Value as JsonValue;

/// A lowered condition and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

/// Converts a comparison value for a field into a bind parameter.
pub type ParamConverter<'a> = &'a dyn Fn(&str, &JsonValue) -> QueryParam;

/// Default converter: plain JSON mapping.
pub fn plain_param(_field: &str, value: &JsonValue) -> QueryParam {
    QueryParam::from(value)
}

/// Lower `filter`; `None` when it places no constraint.
pub fn lower_filter(
    filter: &Record,
    dialect: SqlDialect,
    convert: ParamConverter<'_>,
) -> DbResult<Option<SqlFilter>> {
    let mut lowering = Lowering {
        dialect,
        convert,
        params: Vec::new(),
    };
    let sql = lowering.object(filter)?;
    Ok(sql.map(|sql| SqlFilter {
        sql,
        params: lowering.params,
    }))
}

struct Lowering<'a> {
    dialect: SqlDialect,
    convert: ParamConverter<'a>,
    params: Vec<QueryParam>,
}

fn join_parts(parts: Vec<String>, connector: &str) -> Option<String> {
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(
            parts
                .into_iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join(connector),
        ),
    }
}

impl Lowering<'_> {
    fn object(&mut self, filter: &Record) -> DbResult<Option<String>> {
        let mut parts = Vec::new();
        for (key, value) in filter {
            let part = match key.as_str() {
                "$and" => self.logical(value, " AND ", key)?,
                "$or" => Some(self.logical(value, " OR ", key)?.unwrap_or_else(|| "1 = 0".into())),
                "$nor" => self
                    .logical(value, " OR ", key)?
                    .map(|inner| format!("NOT ({})", inner)),
                k if k.starts_with('$') => {
                    return Err(DbError::invalid_input(format!(
                        "Unsupported top-level operator: {}",
                        k
                    )));
                }
                field => Some(self.field(field, value)?),
            };
            parts.extend(part);
        }
        Ok(join_parts(parts, " AND "))
    }

    fn logical(&mut self, value: &JsonValue, connector: &str, op: &str) -> DbResult<Option<String>> {
        let items = value
            .as_array()
            .ok_or_else(|| DbError::invalid_input(format!("{} expects an array", op)))?;
        let mut parts = Vec::new();
        for item in items {
            let obj = item.as_object().ok_or_else(|| {
                DbError::invalid_input(format!("{} expects an array of objects", op))
            })?;
            // An empty clause matches everything.
            parts.push(self.object(obj)?.unwrap_or_else(|| "1 = 1".into()));
        }
        Ok(join_parts(parts, connector))
    }

    fn column(&self, field: &str) -> DbResult<String> {
        if field.contains('.') {
            return Err(DbError::invalid_input(format!(
                "Nested field paths are only supported on the document backend: {}",
                field
            )));
        }
        quote_identifier(self.dialect, field)
    }

    fn bind(&mut self, field: &str, value: &JsonValue) -> &'static str {
        let param = (self.convert)(field, value);
        self.params.push(param);
        "?"
    }

    fn field(&mut self, field: &str, value: &JsonValue) -> DbResult<String> {
        let col = self.column(field)?;
        match value {
            JsonValue::Null => Ok(format!("{} IS NULL", col)),
            JsonValue::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                let mut parts = Vec::new();
                for (op, operand) in ops {
                    if op == "$options" {
                        continue;
                    }
                    parts.push(self.operator(field, &col, op, operand, ops)?);
                }
                Ok(join_parts(parts, " AND ").unwrap_or_else(|| "1 = 1".into()))
            }
            other => Ok(format!("{} = {}", col, self.bind(field, other))),
        }
    }

    fn operator(
        &mut self,
        field: &str,
        col: &str,
        op: &str,
        operand: &JsonValue,
        siblings: &Record,
    ) -> DbResult<String> {
        let cmp = |sym: &str, this: &mut Self| format!("{} {} {}", col, sym, this.bind(field, operand));
        Ok(match op {
            "$eq" if operand.is_null() => format!("{} IS NULL", col),
            "$eq" => cmp("=", self),
            "$ne" if operand.is_null() => format!("{} IS NOT NULL", col),
            "$ne" => format!("({} <> {} OR {} IS NULL)", col, self.bind(field, operand), col),
            "$gt" => cmp(">", self),
            "$gte" => cmp(">=", self),
            "$lt" => cmp("<", self),
            "$lte" => cmp("<=", self),
            "$in" => self.membership(field, col, operand, true)?,
            "$nin" => self.membership(field, col, operand, false)?,
            "$exists" => {
                if operand.as_bool().unwrap_or(true) {
                    format!("{} IS NOT NULL", col)
                } else {
                    format!("{} IS NULL", col)
                }
            }
            "$regex" => {
                let options = siblings
                    .get("$options")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default();
                self.regex(col, operand, options)?
            }
            "$not" => match operand {
                JsonValue::Object(inner) => {
                    let lowered = self.field(field, &JsonValue::Object(inner.clone()))?;
                    format!("NOT ({})", lowered)
                }
                JsonValue::String(_) => format!("NOT ({})", self.regex(col, operand, "")?),
                _ => return Err(DbError::invalid_input("$not expects an operator object")),
            },
            other => {
                return Err(DbError::invalid_input(format!(
                    "Unsupported filter operator: {}",
                    other
                )));
            }
        })
    }

    fn membership(&mut self, field: &str, col: &str, operand: &JsonValue, include: bool) -> DbResult<String> {
        let items = operand.as_array().ok_or_else(|| {
            DbError::invalid_input(format!(
                "{} expects an array",
                if include { "$in" } else { "$nin" }
            ))
        })?;
        let has_null = items.iter().any(JsonValue::is_null);
        let values: Vec<&JsonValue> = items.iter().filter(|v| !v.is_null()).collect();
        if items.is_empty() {
            return Ok(if include { "1 = 0" } else { "1 = 1" }.to_string());
        }

        let list = if values.is_empty() {
            None
        } else {
            let placeholders: Vec<&str> = values.iter().map(|v| self.bind(field, v)).collect();
            Some(placeholders.join(", "))
        };

        Ok(match (include, list, has_null) {
            (true, Some(list), false) => format!("{} IN ({})", col, list),
            (true, Some(list), true) => format!("({} IN ({}) OR {} IS NULL)", col, list, col),
            (true, None, _) => format!("{} IS NULL", col),
            (false, Some(list), false) => format!("({} NOT IN ({}) OR {} IS NULL)", col, list, col),
            (false, Some(list), true) => format!("({} IS NOT NULL AND {} NOT IN ({}))", col, col, list),
            (false, None, _) => format!("{} IS NOT NULL", col),
        })
    }

    fn regex(&mut self, col: &str, pattern: &JsonValue, options: &str) -> DbResult<String> {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| DbError::invalid_input("$regex expects a string pattern"))?;
        let insensitive = options.contains('i');

        if let Some(like) = literal_like_pattern(pattern) {
            self.params.push(QueryParam::String(like));
            return Ok(if insensitive {
                format!("LOWER({}) LIKE LOWER(?) ESCAPE '!'", col)
            } else {
                format!("{} LIKE ? ESCAPE '!'", col)
            });
        }

        self.params.push(QueryParam::String(pattern.to_string()));
        match self.dialect {
            SqlDialect::Postgres => Ok(format!("{} {} ?", col, if insensitive { "~*" } else { "~" })),
            SqlDialect::MySql => Ok(format!("{} REGEXP ?", col)),
            SqlDialect::Sqlite => Err(DbError::invalid_input(format!(
                "Regular expression filters are not supported on SQLite: {}",
                pattern
            ))),
        }
    }
}

const REGEX_META: &str = ".^$*+?()[]{}|";

/// Translate a regex that only matches literal text (with optional `^`/`$`
/// anchors) into a LIKE pattern using `!` as escape character.
pub fn literal_like_pattern(pattern: &str) -> Option<String> {
    let (anchored_start, rest) = match pattern.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let (anchored_end, body) = match rest.strip_suffix('$') {
        Some(body) if !body.ends_with('\\') || body.ends_with("\\\\") => (true, body),
        _ => (false, rest),
    };

    let mut literal = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                if escaped.is_ascii_alphanumeric() {
                    // \d, \w, \b ... are classes, not literals.
                    return None;
                }
                literal.push(escaped);
            }
            c if REGEX_META.contains(c) => return None,
            c => literal.push(c),
        }
    }

    let mut like = String::with_capacity(literal.len() + 2);
    if !anchored_start {
        like.push('%');
    }
    for c in literal.chars() {
        if matches!(c, '%' | '_' | '!') {
            like.push('!');
        }
        like.push(c);
    }
    if !anchored_end {
        like.push('%');
    }
    Some(like)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lower(filter: JsonValue, dialect: SqlDialect) -> DbResult<Option<SqlFilter>> {
        lower_filter(filter.as_object().unwrap(), dialect, &plain_param)
    }

    fn sql(filter: JsonValue) -> (String, Vec<QueryParam>) {
        let f = lower(filter, SqlDialect::Sqlite).unwrap().unwrap();
        (f.sql, f.params)
    }

    #[test]
    fn test_empty_filter() {
        assert_eq!(lower(json!({}), SqlDialect::Sqlite).unwrap(), None);
    }

    #[test]
    fn test_equality_and_null() {
        let (s, p) = sql(json!({"status": "active", "deleted_at": null}));
        assert_eq!(s, "(\"status\" = ?) AND (\"deleted_at\" IS NULL)");
        assert_eq!(p, vec![QueryParam::from("active")]);
    }

    #[test]
    fn test_comparison_operators() {
        let (s, p) = sql(json!({"age": {"$gte": 18, "$lt": 65}}));
        assert_eq!(s, "(\"age\" >= ?) AND (\"age\" < ?)");
        assert_eq!(p, vec![QueryParam::Int(18), QueryParam::Int(65)]);

        let (s, _) = sql(json!({"deleted_at": {"$ne": null}}));
        assert_eq!(s, "\"deleted_at\" IS NOT NULL");

        let (s, _) = sql(json!({"role": {"$ne": "admin"}}));
        assert_eq!(s, "(\"role\" <> ? OR \"role\" IS NULL)");
    }

    #[test]
    fn test_in_and_nin() {
        let (s, p) = sql(json!({"id": {"$in": [1, 2, 3]}}));
        assert_eq!(s, "\"id\" IN (?, ?, ?)");
        assert_eq!(p.len(), 3);

        assert_eq!(sql(json!({"id": {"$in": []}})).0, "1 = 0");
        assert_eq!(sql(json!({"id": {"$nin": []}})).0, "1 = 1");
        assert_eq!(
            sql(json!({"id": {"$nin": [4]}})).0,
            "(\"id\" NOT IN (?) OR \"id\" IS NULL)"
        );
    }

    #[test]
    fn test_logical_operators() {
        let (s, p) = sql(json!({"$or": [{"a": 1}, {"$and": [{"b": 2}, {"c": 3}]}]}));
        assert_eq!(s, "(\"a\" = ?) OR ((\"b\" = ?) AND (\"c\" = ?))");
        assert_eq!(p, vec![QueryParam::Int(1), QueryParam::Int(2), QueryParam::Int(3)]);

        let (s, _) = sql(json!({"$nor": [{"a": 1}, {"b": 2}]}));
        assert_eq!(s, "NOT ((\"a\" = ?) OR (\"b\" = ?))");

        assert_eq!(sql(json!({"$or": []})).0, "1 = 0");
    }

    #[test]
    fn test_not_and_exists() {
        assert_eq!(
            sql(json!({"age": {"$not": {"$gt": 5}}})).0,
            "NOT (\"age\" > ?)"
        );
        assert_eq!(sql(json!({"email": {"$exists": false}})).0, "\"email\" IS NULL");
    }

    #[test]
    fn test_literal_regex_lowers_to_like() {
        let (s, p) = sql(json!({"name": {"$regex": "jo\\.hn", "$options": "i"}}));
        assert_eq!(s, "LOWER(\"name\") LIKE LOWER(?) ESCAPE '!'");
        assert_eq!(p, vec![QueryParam::from("%jo.hn%")]);

        let (_, p) = sql(json!({"name": {"$regex": "^50%_off$"}}));
        assert_eq!(p, vec![QueryParam::from("50!%!_off")]);
    }

    #[test]
    fn test_non_literal_regex_per_dialect() {
        let filter = json!({"name": {"$regex": "^a.*z$", "$options": "i"}});
        assert!(lower(filter.clone(), SqlDialect::Sqlite).is_err());
        assert_eq!(
            lower(filter.clone(), SqlDialect::Postgres).unwrap().unwrap().sql,
            "\"name\" ~* ?"
        );
        assert_eq!(
            lower(filter, SqlDialect::MySql).unwrap().unwrap().sql,
            "`name` REGEXP ?"
        );
    }

    #[test]
    fn test_literal_like_pattern() {
        assert_eq!(literal_like_pattern("abc").as_deref(), Some("%abc%"));
        assert_eq!(literal_like_pattern("^abc").as_deref(), Some("abc%"));
        assert_eq!(literal_like_pattern("abc$").as_deref(), Some("%abc"));
        assert_eq!(literal_like_pattern("a\\+b").as_deref(), Some("%a+b%"));
        assert_eq!(literal_like_pattern("a\\d"), None);
        assert_eq!(literal_like_pattern("a|b"), None);
    }

    #[test]
    fn test_rejects_bad_fields_and_operators() {
        assert!(lower(json!({"a.b": 1}), SqlDialect::Sqlite).is_err());
        assert!(lower(json!({"a": {"$where": "x"}}), SqlDialect::Sqlite).is_err());
        assert!(lower(json!({"$text": {}}), SqlDialect::Sqlite).is_err());
        assert!(lower(json!({"bad name": 1}), SqlDialect::Sqlite).is_err());
    }

    #[test]
    fn test_converter_sees_field_names() {
        let convert = |field: &str, value: &JsonValue| {
            if field == "created_at" {
                QueryParam::timestamp_from_json(value)
            } else {
                QueryParam::from(value)
            }
        };
        let filter = json!({"created_at": {"$gte": "2024-01-01T00:00:00Z"}});
        let lowered = lower_filter(filter.as_object().unwrap(), SqlDialect::Postgres, &convert)
            .unwrap()
            .unwrap();
        assert_eq!(lowered.params[0].type_name(), "timestamp");
    }
}
