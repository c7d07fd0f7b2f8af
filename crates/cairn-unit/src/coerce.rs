//! Template rendering and string-to-value coercion.
//!
//! Command arguments are minijinja templates rendered against the resolved
//! inputs. Captured process output is a string and gets coerced to the
//! declared output type.
//!
//! ```text
//! args:   ["-in", "{{ in_file }}", "-s", "{{ fwhm }}", "{% if mask %}-mask={{ mask }}{% endif %}"]
//! stdout: "42\n"  (type: integer)  ->  42
//! ```

use std::path::Path;

use minijinja::{Environment, Value};

use crate::error::UnitError;
use crate::types::FieldType;

/// Render a template string against a JSON context.
pub fn render_template(
  env: &Environment,
  template: &str,
  context: &serde_json::Value,
) -> Result<String, minijinja::Error> {
  env.render_str(template, Value::from_serialize(context))
}

/// Coerce a raw string produced by a unit into a typed value.
///
/// Relative paths for `file` and `directory` fields are resolved against
/// `workdir`.
pub fn coerce_value(
  field: &str,
  raw: &str,
  field_type: &FieldType,
  workdir: &Path,
) -> Result<serde_json::Value, UnitError> {
  let value = raw.trim();
  match field_type {
    FieldType::String => Ok(serde_json::Value::String(value.to_string())),

    FieldType::File | FieldType::Directory => {
      let path = workdir.join(value);
      Ok(serde_json::Value::String(path.to_string_lossy().into_owned()))
    }

    FieldType::Number => value
      .parse::<f64>()
      .ok()
      .and_then(serde_json::Number::from_f64)
      .map(serde_json::Value::Number)
      .ok_or_else(|| UnitError::InvalidOutput {
        field: field.to_string(),
        message: format!("expected number, got '{}'", value),
      }),

    FieldType::Integer => value
      .parse::<i64>()
      .map(|n| serde_json::Value::Number(n.into()))
      .map_err(|_| UnitError::InvalidOutput {
        field: field.to_string(),
        message: format!("expected integer, got '{}'", value),
      }),

    FieldType::Boolean => match value.to_lowercase().as_str() {
      "true" => Ok(serde_json::Value::Bool(true)),
      "false" => Ok(serde_json::Value::Bool(false)),
      _ => Err(UnitError::InvalidOutput {
        field: field.to_string(),
        message: format!("expected boolean, got '{}'", value),
      }),
    },

    FieldType::Any => Ok(
      serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
    ),

    FieldType::List(_) | FieldType::Object => {
      let parsed: serde_json::Value =
        serde_json::from_str(value).map_err(|e| UnitError::InvalidOutput {
          field: field.to_string(),
          message: format!("expected {}: {}", field_type, e),
        })?;
      if field_type.matches(&parsed) {
        Ok(parsed)
      } else {
        Err(UnitError::InvalidOutput {
          field: field.to_string(),
          message: format!("expected {}, got {}", field_type, parsed),
        })
      }
    }
  }
}
