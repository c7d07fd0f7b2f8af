use cairn_params::{ParamError, ValidationError};
use cairn_unit::FieldType;
use thiserror::Error;

use crate::node::NodeState;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("invalid node id '{0}': only letters, digits, '_' and '-' are allowed")]
  InvalidNodeId(String),

  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("node not found: {0}")]
  UnknownNode(String),

  #[error("node '{node_id}' has no input '{field}'")]
  UnknownInput { node_id: String, field: String },

  #[error("node '{node_id}' has no output '{field}'")]
  UnknownOutput { node_id: String, field: String },

  #[error("input '{node_id}.{field}' is already bound")]
  AlreadyBound { node_id: String, field: String },

  #[error("edge {from} -> {to} would create a cycle")]
  Cycle { from: String, to: String },

  #[error("type mismatch on {edge}: {expected} cannot accept {found}")]
  TypeMismatch {
    edge: String,
    expected: FieldType,
    found: FieldType,
  },

  #[error("node '{node_id}' has invalid parameters: {}", join(.errors))]
  Validation {
    node_id: String,
    errors: Vec<ValidationError>,
  },

  #[error("node '{node_id}': {source}")]
  Param {
    node_id: String,
    #[source]
    source: ParamError,
  },

  #[error("iterable input '{node_id}.{field}' is not a list")]
  IterableNotList { node_id: String, field: String },

  #[error("node '{0}' is not connected to any other node")]
  DisconnectedNode(String),

  #[error("transform '{name}' on {edge} failed: {message}")]
  Transform {
    edge: String,
    name: String,
    message: String,
  },

  #[error("input '{node_id}.{field}' received a list with failed elements")]
  UpstreamElementFailed { node_id: String, field: String },

  #[error("{} of {total} instances of '{node_id}' failed", .failed_indices.len())]
  PartialFanOutFailure {
    node_id: String,
    failed_indices: Vec<usize>,
    total: usize,
  },

  #[error("instances of '{0}' are not all finished")]
  Incomplete(String),

  #[error("instance '{instance_id}' cannot move from {from:?} to {to:?}")]
  InvalidTransition {
    instance_id: String,
    from: NodeState,
    to: NodeState,
  },
}

fn join(errors: &[ValidationError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}
