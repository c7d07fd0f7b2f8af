use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic type of a declared input or output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
  Any,
  String,
  Integer,
  Number,
  Boolean,
  /// A path to a regular file. Fingerprinted by content.
  File,
  /// A path to a directory. Fingerprinted by the content of every file below it.
  Directory,
  Object,
  List(Box<FieldType>),
}

impl FieldType {
  pub fn list_of(inner: FieldType) -> Self {
    FieldType::List(Box::new(inner))
  }

  /// Whether a field of this type can receive a value of type `other`.
  pub fn accepts(&self, other: &FieldType) -> bool {
    match (self, other) {
      (FieldType::Any, _) | (_, FieldType::Any) => true,
      (FieldType::Number, FieldType::Integer) => true,
      (FieldType::List(a), FieldType::List(b)) => a.accepts(b),
      (a, b) => a == b,
    }
  }

  /// Whether a concrete value conforms to this type.
  pub fn matches(&self, value: &Value) -> bool {
    match self {
      FieldType::Any => true,
      FieldType::String | FieldType::File | FieldType::Directory => value.is_string(),
      FieldType::Integer => value.is_i64() || value.is_u64(),
      FieldType::Number => value.is_number(),
      FieldType::Boolean => value.is_boolean(),
      FieldType::Object => value.is_object(),
      FieldType::List(inner) => value
        .as_array()
        .is_some_and(|items| items.iter().all(|v| inner.matches(v))),
    }
  }

  /// Whether values of this type reference the filesystem, directly or
  /// through list elements.
  pub fn is_path_like(&self) -> bool {
    match self {
      FieldType::File | FieldType::Directory => true,
      FieldType::List(inner) => inner.is_path_like(),
      _ => false,
    }
  }

  /// The element type when this is a list, `Any` for `Any`.
  pub fn element(&self) -> Option<&FieldType> {
    match self {
      FieldType::List(inner) => Some(inner),
      FieldType::Any => Some(&FieldType::Any),
      _ => None,
    }
  }
}

impl fmt::Display for FieldType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FieldType::Any => write!(f, "any"),
      FieldType::String => write!(f, "string"),
      FieldType::Integer => write!(f, "integer"),
      FieldType::Number => write!(f, "number"),
      FieldType::Boolean => write!(f, "boolean"),
      FieldType::File => write!(f, "file"),
      FieldType::Directory => write!(f, "directory"),
      FieldType::Object => write!(f, "object"),
      FieldType::List(inner) => write!(f, "list<{}>", inner),
    }
  }
}

/// A declared input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
  #[serde(default)]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
  /// Fields that do not change the result (verbosity, thread counts) set
  /// this to false and are left out of the fingerprint.
  #[serde(default = "default_true")]
  pub affects_identity: bool,
}

fn default_true() -> bool {
  true
}

impl InputField {
  pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
      required: true,
      default: None,
      affects_identity: true,
    }
  }

  pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
      required: false,
      default: None,
      affects_identity: true,
    }
  }

  pub fn with_default(mut self, value: Value) -> Self {
    self.default = Some(value);
    self
  }

  pub fn excluded_from_identity(mut self) -> Self {
    self.affects_identity = false;
    self
  }
}

/// A declared output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
}

impl OutputField {
  pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
    }
  }
}

/// Declaration of a unit of work: its type name and its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
  pub name: String,
  #[serde(default)]
  pub inputs: Vec<InputField>,
  #[serde(default)]
  pub outputs: Vec<OutputField>,
}

impl UnitSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      inputs: Vec::new(),
      outputs: Vec::new(),
    }
  }

  pub fn input(mut self, field: InputField) -> Self {
    self.inputs.push(field);
    self
  }

  pub fn output(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
    self.outputs.push(OutputField::new(name, field_type));
    self
  }

  pub fn input_field(&self, name: &str) -> Option<&InputField> {
    self.inputs.iter().find(|f| f.name == name)
  }

  pub fn output_field(&self, name: &str) -> Option<&OutputField> {
    self.outputs.iter().find(|f| f.name == name)
  }
}

/// Outputs produced by a unit, keyed by output field name.
pub type OutputSet = BTreeMap<String, Value>;

/// Resolved input values keyed by input field name.
///
/// Backed by a `BTreeMap` so iteration order is always sorted by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Value>);

impl ParameterSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
    self.0.insert(field.into(), value)
  }

  pub fn remove(&mut self, field: &str) -> Option<Value> {
    self.0.remove(field)
  }

  pub fn contains(&self, field: &str) -> bool {
    self.0.contains_key(field)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_map(&self) -> &BTreeMap<String, Value> {
    &self.0
  }

  /// Names of fields whose values differ between `self` and `other`,
  /// including fields present on only one side.
  pub fn changed_fields(&self, other: &ParameterSet) -> Vec<String> {
    let mut changed: Vec<String> = self
      .0
      .iter()
      .filter(|(k, v)| other.0.get(*k) != Some(*v))
      .map(|(k, _)| k.clone())
      .collect();
    changed.extend(
      other
        .0
        .keys()
        .filter(|k| !self.0.contains_key(*k))
        .cloned(),
    );
    changed.sort();
    changed
  }
}

impl From<BTreeMap<String, Value>> for ParameterSet {
  fn from(map: BTreeMap<String, Value>) -> Self {
    Self(map)
  }
}

impl FromIterator<(String, Value)> for ParameterSet {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}
