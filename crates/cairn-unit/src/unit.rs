use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::UnitError;
use crate::types::{OutputSet, ParameterSet, UnitSpec};

/// Context handed to a unit for one invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
  /// Graph node the invocation belongs to.
  pub node_id: String,
  /// Concrete instance id (`node` or `node.3` for fan-out instances).
  pub instance_id: String,
  /// Working directory owned exclusively by this instance. Already exists
  /// and is empty when `run` is called.
  pub workdir: PathBuf,
  /// Cancelled when the run is cancelled. Units should stop promptly and
  /// return [`UnitError::Cancelled`].
  pub cancel: CancellationToken,
}

/// A typed, validated computation step.
///
/// Implementations must be idempotent for the same inputs when invoked into a
/// fresh working directory; the cache relies on it.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
  /// The unit's declaration. Must not change for the lifetime of the value.
  fn spec(&self) -> &UnitSpec;

  /// Run the unit with resolved inputs.
  async fn run(&self, inputs: &ParameterSet, ctx: &RunContext) -> Result<OutputSet, UnitError>;
}

impl fmt::Debug for dyn UnitOfWork {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnitOfWork")
      .field("name", &self.spec().name)
      .finish()
  }
}
