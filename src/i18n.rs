//! Validation message catalog.

/// Resolves message keys (`validation.required`, ...) for a locale.
pub trait Translator: Send + Sync {
    /// Return the message template for `key`. Unknown keys return the key itself.
    fn translate(&self, key: &str, locale: &str) -> String;
}

/// Built-in English catalog. The locale argument is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTranslator;

impl Translator for DefaultTranslator {
    fn translate(&self, key: &str, _locale: &str) -> String {
        let template = match key {
            "validation.required" => "{field} is required",
            "validation.type" => "{field} must be of type {type}",
            "validation.format" => "{field} must be a valid {format}",
            "validation.pattern" => "{field} has an invalid format",
            "validation.min" => "{field} must be at least {min}",
            "validation.max" => "{field} must be at most {max}",
            "validation.min_length" => "{field} must be at least {min} characters",
            "validation.max_length" => "{field} must be at most {max} characters",
            "validation.enum" => "{field} must be one of {values}",
            "validation.array" => "{field} must contain between {min} and {max} items",
            "validation.array_item" => "each item of {field} must be between {min} and {max}",
            "validation.equals" => "{field} must match {other}",
            "validation.not_equals" => "{field} must differ from {other}",
            "validation.compare" => "{field} is invalid compared to {other}",
            "validation.custom" => "{field} is invalid",
            "validation.unique" => "{field} has already been taken",
            "validation.exists" => "{field} does not exist",
            "validation.not_exists" => "{field} already exists",
            "validation.required_when" => "{field} is required",
            "validation.async" => "{field} is invalid",
            other => other,
        };
        template.to_string()
    }
}

/// Replace `{name}` placeholders in `template`.
pub fn interpolate(template: &str, params: &[(&str, String)]) -> String {
    params
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{}}}", name), value)
        })
}
