use std::collections::BTreeMap;

use cairn_unit::{OutputSet, ParameterSet, UnitSpec};
use serde_json::Value;

use crate::error::{ParamError, ValidationError};

/// Resolve provided values against a unit declaration.
///
/// Fills defaults and treats an explicit `null` as absent. Every violation is
/// collected; the result is either a complete set or all of its problems.
pub fn resolve(spec: &UnitSpec, provided: &BTreeMap<String, Value>) -> Result<ParameterSet, ParamError> {
  let errors = check(spec, provided, |_| false);
  if !errors.is_empty() {
    return Err(ParamError::Invalid {
      unit: spec.name.clone(),
      errors,
    });
  }

  let mut params = ParameterSet::new();
  for field in &spec.inputs {
    match provided.get(&field.name) {
      Some(value) if !value.is_null() => {
        params.insert(field.name.clone(), value.clone());
      }
      _ => {
        if let Some(default) = &field.default {
          params.insert(field.name.clone(), default.clone());
        }
      }
    }
  }
  Ok(params)
}

/// Collect violations without building a parameter set.
///
/// `bound_elsewhere` reports fields that will be supplied later (by an edge),
/// so a missing required value for them is not an error yet.
pub fn check(
  spec: &UnitSpec,
  provided: &BTreeMap<String, Value>,
  bound_elsewhere: impl Fn(&str) -> bool,
) -> Vec<ValidationError> {
  let mut errors = Vec::new();

  for name in provided.keys() {
    if spec.input_field(name).is_none() {
      errors.push(ValidationError::UnknownField { field: name.clone() });
    }
  }

  for field in &spec.inputs {
    match provided.get(&field.name) {
      Some(value) if !value.is_null() => {
        if !field.field_type.matches(value) {
          errors.push(ValidationError::TypeMismatch {
            field: field.name.clone(),
            expected: field.field_type.clone(),
            value: value.clone(),
          });
        }
      }
      _ => {
        if field.required && field.default.is_none() && !bound_elsewhere(&field.name) {
          errors.push(ValidationError::MissingRequired {
            field: field.name.clone(),
          });
        }
      }
    }
  }

  errors
}

/// Check a unit's outputs against its declared output fields.
pub fn check_outputs(spec: &UnitSpec, outputs: &OutputSet) -> Vec<ValidationError> {
  let mut errors = Vec::new();
  for field in &spec.outputs {
    match outputs.get(&field.name) {
      None => errors.push(ValidationError::MissingRequired {
        field: field.name.clone(),
      }),
      Some(value) if !field.field_type.matches(value) => {
        errors.push(ValidationError::TypeMismatch {
          field: field.name.clone(),
          expected: field.field_type.clone(),
          value: value.clone(),
        })
      }
      Some(_) => {}
    }
  }
  for name in outputs.keys() {
    if spec.output_field(name).is_none() {
      errors.push(ValidationError::UnknownField { field: name.clone() });
    }
  }
  errors
}
