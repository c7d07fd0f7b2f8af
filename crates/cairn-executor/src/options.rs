use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cairn_params::Fingerprint;
use cairn_workflow::{FanOutPolicy, Node};

use crate::error::ExecutorError;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;

/// Where the executor keeps its files.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// Instance working directories live under `<work_root>/<node_id>`.
  pub work_root: PathBuf,
  /// Crash records are written here.
  pub crash_dir: PathBuf,
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Resolve, fingerprint, and look up only. Nothing runs or is stored.
  pub dry_run: bool,
  /// Re-register results found in working directories under new
  /// fingerprints. Nothing runs.
  pub refresh_hashes: bool,
  /// Node ids, instance ids, or fingerprints that must not be served from
  /// the cache.
  pub force: HashSet<String>,
  /// Concurrency bound for parallel and distributed strategies. Defaults to
  /// the available parallelism.
  pub max_workers: Option<usize>,
  pub fan_out_policy: FanOutPolicy,
}

impl RunOptions {
  pub(crate) fn validate(&self) -> Result<(), ExecutorError> {
    if self.dry_run && self.refresh_hashes {
      return Err(ExecutorError::InvalidOptions {
        message: "dry_run and refresh_hashes are mutually exclusive".to_string(),
      });
    }
    if self.max_workers == Some(0) {
      return Err(ExecutorError::InvalidOptions {
        message: "max_workers must be at least 1".to_string(),
      });
    }
    Ok(())
  }

  pub(crate) fn is_forced(&self, node: &Node, fingerprint: &Fingerprint) -> bool {
    self.force.contains(&node.node_id)
      || self.force.contains(&node.id)
      || self.force.contains(fingerprint.as_str())
  }

  pub(crate) fn workers(&self) -> usize {
    self.max_workers.unwrap_or_else(|| {
      std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
    })
  }
}

/// Settings for running instances through a job queue.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
  pub queue: Arc<dyn JobQueue>,
  pub retry: RetryPolicy,
  pub poll_interval: Duration,
  /// Give up on a job, and cancel it, once it has been outstanding this long.
  pub job_timeout: Option<Duration>,
}

impl DistributedConfig {
  pub fn new(queue: Arc<dyn JobQueue>) -> Self {
    Self {
      queue,
      retry: RetryPolicy::default(),
      poll_interval: Duration::from_millis(500),
      job_timeout: None,
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
    self.job_timeout = Some(job_timeout);
    self
  }
}

/// How ready instances are executed.
#[derive(Debug, Clone)]
pub enum Strategy {
  /// One instance at a time, in topological order, in the calling task.
  Sequential,
  /// Up to `max_workers` instances at a time on the local runtime.
  LocalParallel,
  /// Up to `max_workers` jobs in flight on a job queue.
  Distributed(DistributedConfig),
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Strategy::Sequential => write!(f, "sequential"),
      Strategy::LocalParallel => write!(f, "local_parallel"),
      Strategy::Distributed(_) => write!(f, "distributed"),
    }
  }
}
