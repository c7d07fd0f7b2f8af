use std::path::PathBuf;

use cairn_unit::FieldType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single violation found while resolving a parameter set.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
  #[error("unknown field '{field}'")]
  UnknownField { field: String },

  #[error("missing required field '{field}'")]
  MissingRequired { field: String },

  #[error("field '{field}' expects {expected}, got {value}")]
  TypeMismatch {
    field: String,
    expected: FieldType,
    value: Value,
  },
}

#[derive(Debug, Error)]
pub enum ParamError {
  #[error("invalid parameters for '{unit}': {}", join(.errors))]
  Invalid {
    unit: String,
    errors: Vec<ValidationError>,
  },

  #[error("field '{field}' references a missing path: {}", .path.display())]
  MissingFile { field: String, path: PathBuf },

  #[error("failed to read '{}': {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("not a fingerprint: '{value}'")]
  InvalidFingerprint { value: String },
}

fn join(errors: &[ValidationError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}
