//! Job-queue boundary for distributed execution.
//!
//! The executor hands an instance to a [`JobQueue`] and polls until it
//! reaches a final status. The working directory is passed as a path; the
//! queue's workers must see the same filesystem.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cairn_unit::{OutputSet, ParameterSet, RunContext, UnitError, UnitOfWork};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::instance::run_guarded;

pub type JobId = String;

/// Everything a worker needs to run one instance.
#[derive(Debug, Clone)]
pub struct JobSpec {
  pub node_id: String,
  pub instance_id: String,
  pub unit: Arc<dyn UnitOfWork>,
  pub inputs: ParameterSet,
  pub workdir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
  Queued,
  Running,
  Succeeded(OutputSet),
  Failed(UnitError),
}

impl JobStatus {
  pub fn is_final(&self) -> bool {
    matches!(self, JobStatus::Succeeded(_) | JobStatus::Failed(_))
  }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
  /// The queue could not be reached or is overloaded. Retried.
  #[error("job queue unavailable: {message}")]
  Unavailable { message: String },

  #[error("job rejected: {message}")]
  Rejected { message: String },

  #[error("unknown job: {0}")]
  UnknownJob(JobId),
}

impl QueueError {
  pub fn is_transient(&self) -> bool {
    matches!(self, QueueError::Unavailable { .. })
  }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
  async fn submit(&self, job: JobSpec) -> Result<JobId, QueueError>;

  async fn poll(&self, job_id: &JobId) -> Result<JobStatus, QueueError>;

  /// Best effort. A job that already finished keeps its status.
  async fn cancel(&self, job_id: &JobId) -> Result<(), QueueError>;
}

impl fmt::Debug for dyn JobQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("JobQueue")
  }
}

struct LocalJob {
  status: Arc<Mutex<JobStatus>>,
  cancel: CancellationToken,
}

/// A [`JobQueue`] that runs jobs as tasks on the current tokio runtime.
///
/// A job is forgotten once `poll` has reported its final status.
#[derive(Default)]
pub struct LocalJobQueue {
  jobs: Mutex<HashMap<JobId, LocalJob>>,
  submitted: AtomicUsize,
}

impl LocalJobQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Jobs submitted so far.
  pub fn submitted(&self) -> usize {
    self.submitted.load(Ordering::SeqCst)
  }

  /// Jobs not yet reported final.
  pub fn outstanding(&self) -> usize {
    self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
  }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
  async fn submit(&self, job: JobSpec) -> Result<JobId, QueueError> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let status = Arc::new(Mutex::new(JobStatus::Queued));
    let cancel = CancellationToken::new();

    self.jobs.lock().unwrap_or_else(|e| e.into_inner()).insert(
      job_id.clone(),
      LocalJob {
        status: status.clone(),
        cancel: cancel.clone(),
      },
    );
    self.submitted.fetch_add(1, Ordering::SeqCst);

    debug!(job_id, instance_id = %job.instance_id, "job_submitted");
    tokio::spawn(async move {
      set_status(&status, JobStatus::Running);
      let ctx = RunContext {
        node_id: job.node_id.clone(),
        instance_id: job.instance_id.clone(),
        workdir: job.workdir.clone(),
        cancel,
      };
      let result = match run_guarded(job.unit.as_ref(), &job.inputs, &ctx).await {
        Ok(outputs) => JobStatus::Succeeded(outputs),
        Err(e) => JobStatus::Failed(e),
      };
      let mut current = status.lock().unwrap_or_else(|e| e.into_inner());
      if !current.is_final() {
        *current = result;
      }
    });

    Ok(job_id)
  }

  async fn poll(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
    let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let job = jobs
      .get(job_id)
      .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;
    let status = job.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if status.is_final() {
      jobs.remove(job_id);
    }
    Ok(status)
  }

  async fn cancel(&self, job_id: &JobId) -> Result<(), QueueError> {
    let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
    let job = jobs
      .get(job_id)
      .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;
    job.cancel.cancel();
    let mut status = job.status.lock().unwrap_or_else(|e| e.into_inner());
    if !status.is_final() {
      *status = JobStatus::Failed(UnitError::Cancelled);
    }
    Ok(())
  }
}

fn set_status(status: &Mutex<JobStatus>, next: JobStatus) {
  let mut current = status.lock().unwrap_or_else(|e| e.into_inner());
  if !current.is_final() {
    *current = next;
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use cairn_unit::{FieldType, UnitSpec};
  use serde_json::json;

  struct Answer(UnitSpec);

  #[async_trait]
  impl UnitOfWork for Answer {
    fn spec(&self) -> &UnitSpec {
      &self.0
    }

    async fn run(&self, _: &ParameterSet, ctx: &RunContext) -> Result<OutputSet, UnitError> {
      tokio::select! {
        _ = ctx.cancel.cancelled() => Err(UnitError::Cancelled),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {
          Ok(OutputSet::from([("answer".to_string(), json!(42))]))
        }
      }
    }
  }

  fn job() -> JobSpec {
    JobSpec {
      node_id: "n".to_string(),
      instance_id: "n".to_string(),
      unit: Arc::new(Answer(UnitSpec::new("answer").output("answer", FieldType::Integer))),
      inputs: ParameterSet::new(),
      workdir: std::env::temp_dir(),
    }
  }

  async fn wait_final(queue: &LocalJobQueue, id: &JobId) -> JobStatus {
    loop {
      let status = queue.poll(id).await.unwrap();
      if status.is_final() {
        return status;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  #[tokio::test]
  async fn test_local_queue_runs_job() {
    let queue = LocalJobQueue::new();
    let id = queue.submit(job()).await.unwrap();
    let status = wait_final(&queue, &id).await;
    assert_eq!(
      status,
      JobStatus::Succeeded(OutputSet::from([("answer".to_string(), json!(42))]))
    );
    assert_eq!(queue.submitted(), 1);
    assert_eq!(queue.outstanding(), 0);
    assert!(matches!(queue.poll(&id).await, Err(QueueError::UnknownJob(_))));
  }

  struct Crash(UnitSpec);

  #[async_trait]
  impl UnitOfWork for Crash {
    fn spec(&self) -> &UnitSpec {
      &self.0
    }

    async fn run(&self, _: &ParameterSet, _: &RunContext) -> Result<OutputSet, UnitError> {
      panic!("tool crashed")
    }
  }

  #[tokio::test]
  async fn test_local_queue_reports_panic_as_failure() {
    let queue = LocalJobQueue::new();
    let id = queue
      .submit(JobSpec {
        unit: Arc::new(Crash(UnitSpec::new("crash"))),
        ..job()
      })
      .await
      .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), wait_final(&queue, &id))
      .await
      .unwrap();
    match status {
      JobStatus::Failed(UnitError::Failed { message }) => assert!(message.contains("tool crashed")),
      other => panic!("unexpected status {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_local_queue_cancel() {
    let queue = LocalJobQueue::new();
    let id = queue.submit(job()).await.unwrap();
    queue.cancel(&id).await.unwrap();
    assert_eq!(
      wait_final(&queue, &id).await,
      JobStatus::Failed(UnitError::Cancelled)
    );
  }

  #[tokio::test]
  async fn test_unknown_job() {
    let queue = LocalJobQueue::new();
    assert!(matches!(
      queue.poll(&"nope".to_string()).await,
      Err(QueueError::UnknownJob(_))
    ));
  }
}
