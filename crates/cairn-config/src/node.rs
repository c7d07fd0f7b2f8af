use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Values to fan a node out over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateDef {
  pub field: String,
  pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub node_id: String,
  /// Name of a unit in the pipeline's `units`.
  pub unit: String,
  #[serde(default)]
  pub params: BTreeMap<String, Value>,
  /// Expanded in order; the last field varies fastest.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub iterate: Vec<IterateDef>,
  /// Allowed to have no edges in a multi-node pipeline.
  #[serde(default)]
  pub isolated: bool,
}
