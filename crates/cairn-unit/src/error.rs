//! Unit execution errors.

use serde::{Deserialize, Serialize};

/// Errors a unit of work can report from `run`.
///
/// Serializable so it can be written into crash records and carried back
/// from a remote job queue.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
  /// The external process ran and exited unsuccessfully.
  #[error("process exited with status {code:?}: {stderr}")]
  ProcessFailed { code: Option<i32>, stderr: String },

  /// The external process could not be started.
  #[error("failed to launch '{program}': {message}")]
  Launch { program: String, message: String },

  /// The unit finished but an output was missing or malformed.
  #[error("invalid output '{field}': {message}")]
  InvalidOutput { field: String, message: String },

  /// The unit exceeded its time budget.
  #[error("unit timed out after {timeout_ms}ms")]
  Timeout { timeout_ms: u64 },

  /// The run was cancelled before the unit finished.
  #[error("unit cancelled")]
  Cancelled,

  /// The job queue could not run or report the job.
  #[error("job queue error: {message}")]
  Queue { message: String },

  /// Any other failure reported by a unit implementation.
  #[error("{message}")]
  Failed { message: String },
}

impl UnitError {
  pub fn failed(message: impl Into<String>) -> Self {
    UnitError::Failed {
      message: message.into(),
    }
  }

  /// Stable snake_case name of the error kind.
  pub fn kind(&self) -> &'static str {
    match self {
      UnitError::ProcessFailed { .. } => "process_failed",
      UnitError::Launch { .. } => "launch",
      UnitError::InvalidOutput { .. } => "invalid_output",
      UnitError::Timeout { .. } => "timeout",
      UnitError::Cancelled => "cancelled",
      UnitError::Queue { .. } => "queue",
      UnitError::Failed { .. } => "failed",
    }
  }
}
