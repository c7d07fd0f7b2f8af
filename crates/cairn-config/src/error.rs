use std::path::PathBuf;

use cairn_workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read '{}': {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid pipeline definition: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("unit '{0}' is defined more than once")]
  DuplicateUnit(String),

  #[error("node '{node_id}' uses unknown unit '{unit}'")]
  UnknownUnit { node_id: String, unit: String },

  #[error("invalid transform on edge {edge}: {message}")]
  Transform { edge: String, message: String },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),
}
