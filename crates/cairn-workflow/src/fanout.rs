//! Expansion of a node over the Cartesian product of its iterable inputs,
//! and collection of per-instance outputs back into lists.
//!
//! Combinations are enumerated row-major: the first iterable field is the
//! outermost loop and the last one varies fastest. With `a = [a0, a1]` and
//! `b = [b0, b1, b2]` the instances are
//!
//! ```text
//! 0:(a0,b0) 1:(a0,b1) 2:(a0,b2) 3:(a1,b0) 4:(a1,b1) 5:(a1,b2)
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use cairn_params::{identity, resolve};
use cairn_unit::OutputSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WorkflowError;
use crate::node::{Node, NodeFailure, NodeSpec, NodeState};

const ERROR_KEY: &str = "$error";
const INDEX_KEY: &str = "$index";

/// What collecting a partially failed expansion produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
  /// Any failed instance fails the whole node.
  #[default]
  FailAll,
  /// Failed positions hold an error marker; downstream consumers skip them.
  MarkErrors,
}

/// Placeholder for a failed element in a collected list.
pub fn error_marker(index: usize, message: impl Into<String>) -> Value {
  let mut map = Map::new();
  map.insert(ERROR_KEY.to_string(), Value::String(message.into()));
  map.insert(INDEX_KEY.to_string(), Value::from(index));
  Value::Object(map)
}

pub fn is_error_marker(value: &Value) -> bool {
  value.as_object().is_some_and(|m| m.contains_key(ERROR_KEY))
}

/// Whether the value is, or directly contains, an error marker.
pub fn contains_error_marker(value: &Value) -> bool {
  match value {
    Value::Array(items) => items.iter().any(is_error_marker),
    other => is_error_marker(other),
  }
}

/// Build the instances of one graph node.
///
/// `bound` holds static parameters merged with upstream values; `iterables`
/// names the fields to expand over. Instances whose parameters cannot be
/// resolved or fingerprinted carry the failure in `error` and are left
/// `Pending` for the executor to fail. Combinations that contain an upstream
/// error marker come back `Skipped`.
///
/// Fingerprinting reads files; call from a blocking context.
pub fn expand(
  spec: &NodeSpec,
  bound: &BTreeMap<String, Value>,
  iterables: &[String],
  work_root: &Path,
) -> Result<Vec<Node>, WorkflowError> {
  let unit = spec.unit.spec();

  if iterables.is_empty() {
    let mut node = Node::new(&spec.id, &spec.id, spec.unit.clone(), work_root.join(&spec.id));
    prepare(&mut node, bound, unit);
    return Ok(vec![node]);
  }

  let mut lists = Vec::with_capacity(iterables.len());
  for field in iterables {
    match bound.get(field) {
      Some(Value::Array(items)) => lists.push(items.as_slice()),
      _ => {
        return Err(WorkflowError::IterableNotList {
          node_id: spec.id.clone(),
          field: field.clone(),
        });
      }
    }
  }

  let total: usize = lists.iter().map(|l| l.len()).product();
  let mut nodes = Vec::with_capacity(total);

  for flat in 0..total {
    let combination = unflatten(flat, &lists);
    let mut values = bound.clone();
    let mut blocked = None;
    for ((field, list), &i) in iterables.iter().zip(&lists).zip(&combination) {
      let element = &list[i];
      if is_error_marker(element) && blocked.is_none() {
        blocked = Some(field.clone());
      }
      values.insert(field.clone(), element.clone());
    }

    let mut node = Node::new(
      format!("{}.{}", spec.id, flat),
      &spec.id,
      spec.unit.clone(),
      work_root.join(&spec.id).join(format!("_{}", flat)),
    );
    node.index = Some(flat);
    node.combination = combination;

    match blocked {
      Some(field) => {
        node.error = Some(NodeFailure::new(
          "upstream_failed",
          format!("upstream element for '{}' failed", field),
        ));
        node.transition(NodeState::Skipped)?;
      }
      None => prepare(&mut node, &values, unit),
    }
    nodes.push(node);
  }

  Ok(nodes)
}

fn prepare(node: &mut Node, values: &BTreeMap<String, Value>, unit: &cairn_unit::UnitSpec) {
  let result = resolve(unit, values).and_then(|params| {
    let identity = identity(unit, &params, &node.combination)?;
    Ok((params, identity))
  });
  match result {
    Ok((params, identity)) => {
      node.fingerprint = Some(identity.fingerprint());
      node.identity = Some(identity);
      node.params = params;
    }
    Err(err) => {
      // Keep whatever resolved so crash records show the inputs.
      node.params = values
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
      node.error = Some(NodeFailure::from(&err));
    }
  }
}

/// Row-major decomposition of a flat index into per-list indices.
fn unflatten(mut flat: usize, lists: &[&[Value]]) -> Vec<usize> {
  let mut combination = vec![0; lists.len()];
  for (slot, list) in combination.iter_mut().zip(lists).rev() {
    *slot = flat % list.len();
    flat /= list.len();
  }
  combination
}

/// Collect finished instances into the node's output set.
///
/// A single non-fanned instance collects to its own outputs. Fanned
/// instances collect to one list per declared output field, in instance
/// order.
pub fn collect(spec: &NodeSpec, nodes: &[Node], policy: FanOutPolicy) -> Result<OutputSet, WorkflowError> {
  if nodes.iter().any(|n| !n.state().is_terminal()) {
    return Err(WorkflowError::Incomplete(spec.id.clone()));
  }

  let failed: Vec<usize> = nodes
    .iter()
    .enumerate()
    .filter(|(_, n)| n.state() != NodeState::Done)
    .map(|(i, n)| n.index.unwrap_or(i))
    .collect();

  if let [single] = nodes
    && single.index.is_none()
  {
    return match (&single.outputs, failed.is_empty()) {
      (Some(outputs), true) => Ok(outputs.clone()),
      _ => Err(WorkflowError::PartialFanOutFailure {
        node_id: spec.id.clone(),
        failed_indices: vec![0],
        total: 1,
      }),
    };
  }

  if !failed.is_empty() && policy == FanOutPolicy::FailAll {
    return Err(WorkflowError::PartialFanOutFailure {
      node_id: spec.id.clone(),
      failed_indices: failed,
      total: nodes.len(),
    });
  }

  let mut collected = OutputSet::new();
  for field in &spec.unit.spec().outputs {
    let values = nodes
      .iter()
      .enumerate()
      .map(|(i, node)| {
        let index = node.index.unwrap_or(i);
        match (&node.outputs, node.state()) {
          (Some(outputs), NodeState::Done) => outputs.get(&field.name).cloned().unwrap_or(Value::Null),
          _ => error_marker(
            index,
            node
              .error
              .as_ref()
              .map(|e| e.message.clone())
              .unwrap_or_else(|| format!("instance {:?}", node.state())),
          ),
        }
      })
      .collect();
    collected.insert(field.name.clone(), Value::Array(values));
  }
  Ok(collected)
}
