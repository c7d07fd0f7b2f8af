use std::fmt;
use std::sync::Arc;

use cairn_unit::FieldType;
use serde_json::Value;

type TransformFn = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;

/// A named value conversion applied while data crosses an edge.
///
/// The transform sees the whole value the edge carries, which for a fanned
/// out source is the collected list.
#[derive(Clone)]
pub struct EdgeTransform {
  name: String,
  func: Arc<TransformFn>,
  output_type: Option<FieldType>,
}

impl EdgeTransform {
  pub fn new<F>(name: impl Into<String>, func: F) -> Self
  where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      func: Arc::new(func),
      output_type: None,
    }
  }

  /// Declare the type the transform produces. Without it the edge keeps the
  /// source type.
  pub fn with_output_type(mut self, field_type: FieldType) -> Self {
    self.output_type = Some(field_type);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn output_type(&self) -> Option<&FieldType> {
    self.output_type.as_ref()
  }

  pub fn apply(&self, value: &Value) -> Result<Value, String> {
    (self.func)(value)
  }
}

impl fmt::Debug for EdgeTransform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EdgeTransform")
      .field("name", &self.name)
      .field("output_type", &self.output_type)
      .finish()
  }
}

/// A data dependency: `from.output` feeds `to.input`.
#[derive(Debug, Clone)]
pub struct Edge {
  pub from: String,
  pub output: String,
  pub to: String,
  pub input: String,
  pub transform: Option<EdgeTransform>,
  /// Expand `to` over the elements of the carried list instead of passing
  /// the list as one value.
  pub iterable: bool,
}

impl Edge {
  pub fn new(
    from: impl Into<String>,
    output: impl Into<String>,
    to: impl Into<String>,
    input: impl Into<String>,
  ) -> Self {
    Self {
      from: from.into(),
      output: output.into(),
      to: to.into(),
      input: input.into(),
      transform: None,
      iterable: false,
    }
  }

  pub fn with_transform(mut self, transform: EdgeTransform) -> Self {
    self.transform = Some(transform);
    self
  }

  pub fn iterable(mut self) -> Self {
    self.iterable = true;
    self
  }

  /// `from.output -> to.input`, for messages.
  pub fn label(&self) -> String {
    format!("{}.{} -> {}.{}", self.from, self.output, self.to, self.input)
  }
}
