use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cairn_unit::UnitOfWork;
use cairn_workflow::{Edge, EdgeTransform, Graph, NodeSpec};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::edge::EdgeDef;
use crate::error::ConfigError;
use crate::node::NodeDef;
use crate::unit::UnitDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDef {
  /// Also names the pipeline's directories under the data directory.
  pub name: String,
  #[serde(default)]
  pub units: Vec<UnitDef>,
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub edges: Vec<EdgeDef>,
}

impl PipelineDef {
  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&text)
  }

  /// Compile into a graph. Structural problems (unknown units, cycles,
  /// mistyped edges) fail here; parameter validation is left to
  /// [`Graph::validate`].
  pub fn build(&self) -> Result<Graph, ConfigError> {
    let mut units: HashMap<&str, Arc<dyn UnitOfWork>> = HashMap::new();
    for def in &self.units {
      if units.insert(def.name.as_str(), Arc::new(def.build())).is_some() {
        return Err(ConfigError::DuplicateUnit(def.name.clone()));
      }
    }

    let mut graph = Graph::new();
    for node in &self.nodes {
      let unit = units
        .get(node.unit.as_str())
        .cloned()
        .ok_or_else(|| ConfigError::UnknownUnit {
          node_id: node.node_id.clone(),
          unit: node.unit.clone(),
        })?;
      let mut spec = NodeSpec::new(&node.node_id, unit);
      for (field, value) in &node.params {
        spec = spec.param(field, value.clone());
      }
      for iterate in &node.iterate {
        spec = spec.iterate(&iterate.field, iterate.values.clone());
      }
      if node.isolated {
        spec = spec.isolated();
      }
      graph.add_node(spec)?;
    }

    for def in &self.edges {
      let mut edge = Edge::new(&def.from, &def.output, &def.to, &def.input);
      if let Some(expr) = &def.transform {
        edge = edge.with_transform(expression_transform(def, expr)?);
      }
      if def.iterable {
        edge = edge.iterable();
      }
      graph.connect_edge(edge)?;
    }

    debug!(pipeline = %self.name, nodes = graph.len(), edges = graph.edges().len(), "pipeline_built");
    Ok(graph)
  }
}

/// An edge transform evaluating a minijinja expression with the carried
/// value bound to `value`.
fn expression_transform(def: &EdgeDef, expr: &str) -> Result<EdgeTransform, ConfigError> {
  Environment::new()
    .compile_expression(expr)
    .map_err(|e| ConfigError::Transform {
      edge: def.label(),
      message: e.to_string(),
    })?;

  let source = expr.to_string();
  let transform = EdgeTransform::new(expr, move |value: &Value| {
    let env = Environment::new();
    let compiled = env.compile_expression(&source).map_err(|e| e.to_string())?;
    let result = compiled
      .eval(minijinja::context! { value => minijinja::Value::from_serialize(value) })
      .map_err(|e| e.to_string())?;
    serde_json::to_value(&result).map_err(|e| e.to_string())
  });

  Ok(match &def.transform_type {
    Some(field_type) => transform.with_output_type(field_type.clone()),
    None => transform,
  })
}
