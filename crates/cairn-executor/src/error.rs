use cairn_workflow::WorkflowError;

/// Errors that abort a run as a whole.
///
/// Per-node failures never show up here; they are recorded in the
/// [`RunReport`](crate::RunReport) and in crash records.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// The graph failed validation. Nothing was executed.
  #[error("invalid workflow graph: {}", join(.errors))]
  InvalidGraph { errors: Vec<WorkflowError> },

  #[error("invalid run options: {message}")]
  InvalidOptions { message: String },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error("task join error: {message}")]
  Join { message: String },
}

fn join(errors: &[WorkflowError]) -> String {
  errors
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join("; ")
}
