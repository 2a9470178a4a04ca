//! Built-in transformations (`string`, `number`, `boolean`) and the `concat`
//! derivation.

use crate::traits::{Derivation, Transformation};
use resmodel_core::{Error, FieldOptions, FieldReader, Result, Value};
use serde_json::Number;

/// Coerces values to strings; `null` stays `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringTransform;

fn to_string_value(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Null,
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(other) => Value::String(other.to_string()),
    }
}

impl Transformation for StringTransform {
    fn hydrate(&self, raw: Option<&Value>, _options: &FieldOptions) -> Result<Value> {
        Ok(to_string_value(raw))
    }

    fn serialize(&self, value: &Value, _options: &FieldOptions) -> Result<Value> {
        Ok(to_string_value(Some(value)))
    }
}

/// Coerces values to JSON numbers; anything unparseable becomes `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumberTransform;

fn to_number_value(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Number(n)) => Value::Number(n.clone()),
        Some(Value::Bool(b)) => Value::from(u8::from(*b)),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Value::from(int)
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        _ => Value::Null,
    }
}

impl Transformation for NumberTransform {
    fn hydrate(&self, raw: Option<&Value>, _options: &FieldOptions) -> Result<Value> {
        Ok(to_number_value(raw))
    }

    fn serialize(&self, value: &Value, _options: &FieldOptions) -> Result<Value> {
        Ok(to_number_value(Some(value)))
    }
}

/// Coerces values to booleans.
///
/// `null` hydrates to `false` unless the field sets the `allowNull` option.
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanTransform;

fn allow_null(options: &FieldOptions) -> bool {
    options
        .extra
        .get("allowNull")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn to_bool_value(value: Option<&Value>, options: &FieldOptions) -> Value {
    match value {
        None | Some(Value::Null) if allow_null(options) => Value::Null,
        None | Some(Value::Null) => Value::Bool(false),
        Some(Value::Bool(b)) => Value::Bool(*b),
        Some(Value::Number(n)) => Value::Bool(n.as_f64() == Some(1.0)),
        Some(Value::String(s)) => {
            let s = s.to_ascii_lowercase();
            Value::Bool(s == "true" || s == "t" || s == "1")
        }
        Some(_) => Value::Bool(false),
    }
}

impl Transformation for BooleanTransform {
    fn hydrate(&self, raw: Option<&Value>, options: &FieldOptions) -> Result<Value> {
        Ok(to_bool_value(raw, options))
    }

    fn serialize(&self, value: &Value, options: &FieldOptions) -> Result<Value> {
        Ok(to_bool_value(Some(value), options))
    }

    fn default_value(&self, options: &FieldOptions) -> Option<Value> {
        (!allow_null(options)).then_some(Value::Bool(false))
    }
}

/// Joins other fields of the record with a separator.
///
/// Options: `fields` (array of field names, required) and `separator`
/// (default `" "`). Null fields are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatDerivation;

impl Derivation for ConcatDerivation {
    fn derive(
        &self,
        record: &dyn FieldReader,
        options: &FieldOptions,
        field: &str,
    ) -> Result<Value> {
        let fields = options
            .extra
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "concat derivation for '{}.{}' requires a 'fields' option",
                    record.key().type_name(),
                    field
                ))
            })?;
        let separator = options
            .extra
            .get("separator")
            .and_then(Value::as_str)
            .unwrap_or(" ");

        let mut parts = Vec::with_capacity(fields.len());
        for name in fields.iter().filter_map(Value::as_str) {
            match record.read_field(name)? {
                Value::Null => {}
                Value::String(s) => parts.push(s),
                other => parts.push(other.to_string()),
            }
        }
        Ok(Value::String(parts.join(separator)))
    }
}
