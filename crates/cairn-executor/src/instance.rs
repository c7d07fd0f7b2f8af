//! Execution of a single node instance: claim, look up, run, store.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use cairn_cache::{CacheEntry, CacheStore};
use cairn_params::{Fingerprint, Identity};
use cairn_unit::{FieldType, OutputSet, ParameterSet, RunContext, UnitError, UnitOfWork, UnitSpec};
use cairn_workflow::{Node, NodeFailure, NodeState};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crash::{CrashRecord, CrashStore};
use crate::error::ExecutorError;
use crate::events::{ExecutionEvent, ExecutionNotifier};
use crate::options::{DistributedConfig, RunOptions};
use crate::queue::{JobSpec, JobStatus};
use crate::report::CacheOutcome;
use crate::retry::with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
  Execute,
  DryRun,
  Refresh,
}

/// Everything instance tasks share for the duration of one run.
pub(crate) struct RunShared {
  pub run_id: String,
  pub mode: Mode,
  pub options: RunOptions,
  pub cache: Arc<dyn CacheStore>,
  pub crashes: CrashStore,
  pub notifier: Arc<dyn ExecutionNotifier>,
  pub remote: Option<DistributedConfig>,
  pub cancel: CancellationToken,
}

/// Result of handling one instance.
#[derive(Debug)]
pub(crate) struct Finished {
  pub node: Node,
  pub cache: CacheOutcome,
  pub executed: bool,
  pub crash_record: Option<std::path::PathBuf>,
}

impl Finished {
  fn new(node: Node, cache: CacheOutcome) -> Self {
    Self {
      node,
      cache,
      executed: false,
      crash_record: None,
    }
  }
}

/// Drive one `Ready` instance to its final state for this run.
///
/// In dry-run and refresh modes an instance the cache cannot answer is
/// returned still `Ready` with a `Miss` outcome.
pub(crate) async fn execute_instance(shared: Arc<RunShared>, mut node: Node) -> Result<Finished, ExecutorError> {
  let (Some(fingerprint), Some(identity)) = (node.fingerprint.clone(), node.identity.clone()) else {
    let failure = node
      .error
      .clone()
      .unwrap_or_else(|| NodeFailure::new("failed", "instance has no fingerprint"));
    return fail(&shared, node, failure, false).await;
  };

  if shared.cancel.is_cancelled() {
    node.transition(NodeState::Cancelled)?;
    return Ok(Finished::new(node, CacheOutcome::Unknown));
  }

  let forced = shared.options.is_forced(&node, &fingerprint);

  if shared.mode == Mode::DryRun {
    let cached = if forced {
      None
    } else {
      lookup(&shared, &fingerprint).await
    };
    return Ok(match cached {
      Some(entry) => {
        node.complete(entry.outputs)?;
        Finished::new(node, CacheOutcome::Hit)
      }
      None => Finished::new(node, CacheOutcome::Miss),
    });
  }

  let _claim = shared.cache.claim(&fingerprint).await;

  if forced && shared.mode == Mode::Execute {
    match shared.cache.invalidate(&fingerprint).await {
      Ok(true) => info!(instance_id = %node.id, fingerprint = %fingerprint.short(), "cache_entry_invalidated"),
      Ok(false) => {}
      Err(e) => warn!(instance_id = %node.id, error = %e, "cache_invalidate_failed"),
    }
  }

  if !forced && let Some(entry) = lookup(&shared, &fingerprint).await {
    info!(
      instance_id = %node.id,
      fingerprint = %fingerprint.short(),
      "node_cached"
    );
    shared.notifier.notify(ExecutionEvent::NodeCached {
      run_id: shared.run_id.clone(),
      node_id: node.node_id.clone(),
      instance_id: node.id.clone(),
      fingerprint: fingerprint.clone(),
    });
    node.complete(entry.outputs)?;
    return Ok(Finished::new(node, CacheOutcome::Hit));
  }

  let marker = match shared.cache.read_marker(&node.workdir).await {
    Ok(marker) => marker,
    Err(e) => {
      warn!(instance_id = %node.id, error = %e, "result_marker_unreadable");
      None
    }
  };

  if shared.mode == Mode::Refresh {
    return refresh(&shared, node, fingerprint, identity, marker, forced).await;
  }

  if let Some(previous) = marker.filter(|m| m.fingerprint != fingerprint) {
    let changed = ParameterSet::from(previous.identity.inputs.clone())
      .changed_fields(&ParameterSet::from(identity.inputs.clone()));
    info!(instance_id = %node.id, changed = ?changed, "node_inputs_changed");
  }

  if let Err(e) = reset_workdir(&node.workdir).await {
    let failure = NodeFailure::new("io", format!("failed to prepare {}: {}", node.workdir.display(), e));
    return fail(&shared, node, failure, false).await;
  }

  if shared.cancel.is_cancelled() {
    node.transition(NodeState::Cancelled)?;
    return Ok(Finished::new(node, CacheOutcome::Miss));
  }

  node.transition(NodeState::Running)?;
  info!(instance_id = %node.id, fingerprint = %fingerprint.short(), "node_started");
  shared.notifier.notify(ExecutionEvent::NodeStarted {
    run_id: shared.run_id.clone(),
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
  });

  let result = match &shared.remote {
    Some(remote) => run_remote(remote, &node, &shared.cancel).await,
    None => run_local(&node, &shared.cancel).await,
  };

  let outputs = match result {
    Ok(outputs) => outputs,
    Err(UnitError::Cancelled) => {
      info!(instance_id = %node.id, "node_cancelled");
      node.transition(NodeState::Cancelled)?;
      let mut finished = Finished::new(node, CacheOutcome::Miss);
      finished.executed = true;
      return Ok(finished);
    }
    Err(e) => return fail(&shared, node, NodeFailure::from(&e), true).await,
  };

  let violations = cairn_params::check_outputs(node.unit.spec(), &outputs);
  if !violations.is_empty() {
    let message = violations
      .iter()
      .map(ToString::to_string)
      .collect::<Vec<_>>()
      .join("; ");
    return fail(&shared, node, NodeFailure::new("invalid_output", message), true).await;
  }

  if shared.cancel.is_cancelled() {
    // Finished, but the run was cancelled meanwhile; keep nothing.
    node.transition(NodeState::Cancelled)?;
    let mut finished = Finished::new(node, CacheOutcome::Miss);
    finished.executed = true;
    return Ok(finished);
  }

  if let Err(e) = shared
    .cache
    .store(&fingerprint, &identity, &outputs, &node.workdir)
    .await
  {
    warn!(instance_id = %node.id, error = %e, "cache_store_failed");
  }

  info!(instance_id = %node.id, fingerprint = %fingerprint.short(), "node_completed");
  shared.notifier.notify(ExecutionEvent::NodeCompleted {
    run_id: shared.run_id.clone(),
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
    outputs: outputs.clone(),
  });
  node.complete(outputs)?;

  let mut finished = Finished::new(node, CacheOutcome::Miss);
  finished.executed = true;
  Ok(finished)
}

/// Re-register a previous result found in the working directory if its
/// inputs only moved.
async fn refresh(
  shared: &RunShared,
  mut node: Node,
  fingerprint: Fingerprint,
  identity: Identity,
  marker: Option<CacheEntry>,
  forced: bool,
) -> Result<Finished, ExecutorError> {
  let previous = match marker {
    Some(previous) if !forced && previous.identity.relocatable() == identity.relocatable() => previous,
    _ => {
      debug!(instance_id = %node.id, "refresh_not_possible");
      return Ok(Finished::new(node, CacheOutcome::Miss));
    }
  };

  let outputs = rebase_outputs(node.unit.spec(), &previous.outputs, &previous.workdir, &node.workdir);
  match shared
    .cache
    .store(&fingerprint, &identity, &outputs, &node.workdir)
    .await
  {
    Ok(_) => {
      info!(
        instance_id = %node.id,
        old = %previous.fingerprint.short(),
        new = %fingerprint.short(),
        "hash_refreshed"
      );
      shared.notifier.notify(ExecutionEvent::NodeCached {
        run_id: shared.run_id.clone(),
        node_id: node.node_id.clone(),
        instance_id: node.id.clone(),
        fingerprint,
      });
      node.complete(outputs)?;
      Ok(Finished::new(node, CacheOutcome::Refreshed))
    }
    Err(e) => {
      warn!(instance_id = %node.id, error = %e, "cache_store_failed");
      Ok(Finished::new(node, CacheOutcome::Miss))
    }
  }
}

/// Rewrite path-typed outputs that lived under `from` to live under `to`.
pub(crate) fn rebase_outputs(spec: &UnitSpec, outputs: &OutputSet, from: &Path, to: &Path) -> OutputSet {
  outputs
    .iter()
    .map(|(name, value)| {
      let rebased = match spec.output_field(name) {
        Some(field) if field.field_type.is_path_like() => rebase_value(&field.field_type, value, from, to),
        _ => value.clone(),
      };
      (name.clone(), rebased)
    })
    .collect()
}

fn rebase_value(field_type: &FieldType, value: &Value, from: &Path, to: &Path) -> Value {
  match (field_type, value) {
    (FieldType::List(inner), Value::Array(items)) => Value::Array(
      items
        .iter()
        .map(|item| rebase_value(inner, item, from, to))
        .collect(),
    ),
    (_, Value::String(path)) => match Path::new(path).strip_prefix(from) {
      Ok(rest) if rest.as_os_str().is_empty() => Value::String(to.to_string_lossy().into_owned()),
      Ok(rest) => Value::String(to.join(rest).to_string_lossy().into_owned()),
      Err(_) => value.clone(),
    },
    _ => value.clone(),
  }
}

async fn lookup(shared: &RunShared, fingerprint: &Fingerprint) -> Option<CacheEntry> {
  match shared.cache.lookup(fingerprint).await {
    Ok(entry) => entry,
    Err(e) => {
      warn!(fingerprint = %fingerprint.short(), error = %e, "cache_lookup_failed");
      None
    }
  }
}

async fn reset_workdir(workdir: &Path) -> std::io::Result<()> {
  match tokio::fs::remove_dir_all(workdir).await {
    Ok(()) => {}
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => return Err(e),
  }
  tokio::fs::create_dir_all(workdir).await
}

async fn run_local(node: &Node, cancel: &CancellationToken) -> Result<OutputSet, UnitError> {
  let ctx = RunContext {
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
    workdir: node.workdir.clone(),
    cancel: cancel.clone(),
  };
  run_guarded(node.unit.as_ref(), &node.params, &ctx).await
}

/// Run a unit, turning a panic into a failure of that unit.
pub(crate) async fn run_guarded(
  unit: &dyn UnitOfWork,
  inputs: &ParameterSet,
  ctx: &RunContext,
) -> Result<OutputSet, UnitError> {
  match AssertUnwindSafe(unit.run(inputs, ctx)).catch_unwind().await {
    Ok(result) => result,
    Err(payload) => {
      let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
      Err(UnitError::failed(format!("unit panicked: {}", detail)))
    }
  }
}

async fn run_remote(
  remote: &DistributedConfig,
  node: &Node,
  cancel: &CancellationToken,
) -> Result<OutputSet, UnitError> {
  let job = JobSpec {
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
    unit: node.unit.clone(),
    inputs: node.params.clone(),
    workdir: node.workdir.clone(),
  };
  let queue = remote.queue.as_ref();

  let job_id = with_retry(&remote.retry, "submit", || queue.submit(job.clone()))
    .await
    .map_err(|e| UnitError::Queue {
      message: e.to_string(),
    })?;
  debug!(instance_id = %node.id, job_id, "job_submitted");

  let started = tokio::time::Instant::now();
  loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        if let Err(e) = queue.cancel(&job_id).await {
          warn!(job_id, error = %e, "job_cancel_failed");
        }
        return Err(UnitError::Cancelled);
      }
      _ = tokio::time::sleep(remote.poll_interval) => {}
    }

    if let Some(limit) = remote.job_timeout.filter(|limit| started.elapsed() >= *limit) {
      warn!(job_id, timeout_ms = limit.as_millis() as u64, "job_timed_out");
      if let Err(e) = queue.cancel(&job_id).await {
        warn!(job_id, error = %e, "job_cancel_failed");
      }
      return Err(UnitError::Timeout {
        timeout_ms: limit.as_millis() as u64,
      });
    }

    let status = with_retry(&remote.retry, "poll", || queue.poll(&job_id))
      .await
      .map_err(|e| UnitError::Queue {
        message: e.to_string(),
      })?;
    match status {
      JobStatus::Queued | JobStatus::Running => continue,
      JobStatus::Succeeded(outputs) => return Ok(outputs),
      JobStatus::Failed(e) => return Err(e),
    }
  }
}

/// Write the crash record, then mark the instance failed. Planning modes
/// leave no crash records behind.
pub(crate) async fn fail(
  shared: &RunShared,
  mut node: Node,
  failure: NodeFailure,
  executed: bool,
) -> Result<Finished, ExecutorError> {
  let record = CrashRecord {
    run_id: shared.run_id.clone(),
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
    unit: node.unit.spec().name.clone(),
    fingerprint: node.fingerprint.clone(),
    params: node.params.clone(),
    error_kind: failure.kind.clone(),
    message: failure.message.clone(),
    workdir: node.workdir.clone(),
    occurred_at: Utc::now(),
  };
  let crash_record = if shared.mode != Mode::Execute {
    None
  } else {
    match shared.crashes.write(record).await {
      Ok(path) => Some(path),
      Err(e) => {
        error!(instance_id = %node.id, error = %e, "crash_record_write_failed");
        None
      }
    }
  };

  error!(
    instance_id = %node.id,
    kind = %failure.kind,
    error = %failure.message,
    "node_failed"
  );
  shared.notifier.notify(ExecutionEvent::NodeFailed {
    run_id: shared.run_id.clone(),
    node_id: node.node_id.clone(),
    instance_id: node.id.clone(),
    error: failure.message.clone(),
  });

  node.fail(failure)?;
  Ok(Finished {
    node,
    cache: if executed {
      CacheOutcome::Miss
    } else {
      CacheOutcome::Unknown
    },
    executed,
    crash_record,
  })
}
