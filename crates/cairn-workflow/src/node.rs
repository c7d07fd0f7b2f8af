use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use cairn_params::{Fingerprint, Identity, ParamError};
use cairn_unit::{OutputSet, ParameterSet, UnitError, UnitOfWork};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;

/// A node as declared in a graph: a unit plus its static parameters.
#[derive(Debug, Clone)]
pub struct NodeSpec {
  pub id: String,
  pub unit: Arc<dyn UnitOfWork>,
  /// Static input values. Values of iterable fields are lists.
  pub params: BTreeMap<String, Value>,
  /// Input fields whose static list value is expanded, in declaration order.
  pub iterables: Vec<String>,
  /// Allowed to have no edges in a multi-node graph.
  pub isolated: bool,
}

impl NodeSpec {
  pub fn new(id: impl Into<String>, unit: Arc<dyn UnitOfWork>) -> Self {
    Self {
      id: id.into(),
      unit,
      params: BTreeMap::new(),
      iterables: Vec::new(),
      isolated: false,
    }
  }

  pub fn param(mut self, field: impl Into<String>, value: Value) -> Self {
    self.params.insert(field.into(), value);
    self
  }

  /// Expand this node over `values`, one instance per element.
  pub fn iterate(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
    let field = field.into();
    self.params.insert(field.clone(), Value::Array(values));
    if !self.iterables.contains(&field) {
      self.iterables.push(field);
    }
    self
  }

  pub fn isolated(mut self) -> Self {
    self.isolated = true;
    self
  }
}

/// Lifecycle of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Pending,
  Ready,
  Running,
  Done,
  Failed,
  Skipped,
  Cancelled,
}

impl NodeState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      NodeState::Done | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
    )
  }

  /// A cache hit goes straight from `Ready` to `Done`.
  pub fn can_transition_to(self, next: NodeState) -> bool {
    use NodeState::*;
    matches!(
      (self, next),
      (Pending, Ready | Skipped | Cancelled)
        | (Ready, Running | Done | Failed | Skipped | Cancelled)
        | (Running, Done | Failed | Cancelled)
    )
  }
}

/// Why an instance did not produce outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
  pub kind: String,
  pub message: String,
}

impl NodeFailure {
  pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      message: message.into(),
    }
  }
}

impl From<&UnitError> for NodeFailure {
  fn from(err: &UnitError) -> Self {
    NodeFailure::new(err.kind(), err.to_string())
  }
}

impl From<&ParamError> for NodeFailure {
  fn from(err: &ParamError) -> Self {
    let kind = match err {
      ParamError::Invalid { .. } => "invalid_params",
      ParamError::MissingFile { .. } => "missing_file",
      ParamError::Io { .. } => "io",
      ParamError::InvalidFingerprint { .. } => "invalid_fingerprint",
    };
    NodeFailure::new(kind, err.to_string())
  }
}

/// A concrete, executable instance of a graph node.
#[derive(Debug, Clone)]
pub struct Node {
  /// `node_id` or `node_id.index` for fan-out instances.
  pub id: String,
  pub node_id: String,
  pub index: Option<usize>,
  pub combination: Vec<usize>,
  pub unit: Arc<dyn UnitOfWork>,
  pub params: ParameterSet,
  /// Absent when the parameters could not be resolved or an upstream
  /// element failed.
  pub identity: Option<Identity>,
  pub fingerprint: Option<Fingerprint>,
  pub workdir: PathBuf,
  pub outputs: Option<OutputSet>,
  pub error: Option<NodeFailure>,
  state: NodeState,
}

impl Node {
  pub fn new(
    id: impl Into<String>,
    node_id: impl Into<String>,
    unit: Arc<dyn UnitOfWork>,
    workdir: PathBuf,
  ) -> Self {
    Self {
      id: id.into(),
      node_id: node_id.into(),
      index: None,
      combination: Vec::new(),
      unit,
      params: ParameterSet::new(),
      identity: None,
      fingerprint: None,
      workdir,
      outputs: None,
      error: None,
      state: NodeState::Pending,
    }
  }

  pub fn state(&self) -> NodeState {
    self.state
  }

  pub fn transition(&mut self, next: NodeState) -> Result<(), WorkflowError> {
    if !self.state.can_transition_to(next) {
      return Err(WorkflowError::InvalidTransition {
        instance_id: self.id.clone(),
        from: self.state,
        to: next,
      });
    }
    self.state = next;
    Ok(())
  }

  pub fn complete(&mut self, outputs: OutputSet) -> Result<(), WorkflowError> {
    self.transition(NodeState::Done)?;
    self.outputs = Some(outputs);
    Ok(())
  }

  pub fn fail(&mut self, failure: NodeFailure) -> Result<(), WorkflowError> {
    self.transition(NodeState::Failed)?;
    self.error = Some(failure);
    Ok(())
  }
}
