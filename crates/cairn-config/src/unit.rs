use std::time::Duration;

use cairn_unit::{CommandUnit, FieldType, InputField, OutputSource, UnitSpec};
use serde::{Deserialize, Serialize};

/// A declared output and where its value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
  pub name: String,
  #[serde(rename = "type")]
  pub field_type: FieldType,
  /// Defaults to stdout.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<OutputSource>,
}

/// A command-line unit: the program, its argument templates, and its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDef {
  pub name: String,
  pub program: String,
  /// minijinja templates rendered against the resolved inputs and `workdir`.
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub inputs: Vec<InputField>,
  #[serde(default)]
  pub outputs: Vec<OutputDef>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl UnitDef {
  pub fn spec(&self) -> UnitSpec {
    let spec = self.inputs.iter().cloned().fold(UnitSpec::new(&self.name), UnitSpec::input);
    self
      .outputs
      .iter()
      .fold(spec, |spec, out| spec.output(&out.name, out.field_type.clone()))
  }

  pub fn build(&self) -> CommandUnit {
    let mut unit = CommandUnit::new(self.spec(), &self.program).args(self.args.iter().cloned());
    for output in &self.outputs {
      if let Some(source) = &output.source {
        unit = unit.output_from(&output.name, source.clone());
      }
    }
    if let Some(ms) = self.timeout_ms {
      unit = unit.timeout(Duration::from_millis(ms));
    }
    unit
  }
}
