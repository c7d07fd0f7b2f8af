use cairn_unit::FieldType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub from: String,
  pub output: String,
  pub to: String,
  pub input: String,
  /// minijinja expression over `value`, e.g. `value | first`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub transform: Option<String>,
  /// Type produced by the transform, when it differs from the carried type.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub transform_type: Option<FieldType>,
  #[serde(default)]
  pub iterable: bool,
}

impl EdgeDef {
  pub fn label(&self) -> String {
    format!("{}.{} -> {}.{}", self.from, self.output, self.to, self.input)
  }
}
