//! Graph scheduling.
//!
//! [`Executor::run`] walks the graph in topological order. A graph node is
//! expanded into instances once every upstream node is `Done`; instances are
//! queued and dispatched according to the [`Strategy`]. When all instances of
//! a node have finished, they are collected into the node's outputs, which
//! may in turn make downstream nodes ready.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use cairn_cache::CacheStore;
use cairn_unit::{OutputSet, ParameterSet};
use cairn_workflow::{Graph, Node, NodeFailure, NodeState, WorkflowError, fanout};
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::crash::{CrashRecord, CrashStore};
use crate::error::ExecutorError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::instance::{Finished, Mode, RunShared, execute_instance};
use crate::options::{ExecutorConfig, RunOptions, Strategy};
use crate::report::{CacheOutcome, InstanceReport, NodeReport, RunReport};

/// Runs workflow graphs against a cache.
///
/// One executor may serve several concurrent runs; they share the cache
/// store and therefore its per-fingerprint claims.
pub struct Executor {
  config: ExecutorConfig,
  cache: Arc<dyn CacheStore>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl Executor {
  pub fn new(config: ExecutorConfig, cache: Arc<dyn CacheStore>) -> Self {
    Self {
      config,
      cache,
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn with_notifier(mut self, notifier: impl ExecutionNotifier + 'static) -> Self {
    self.notifier = Arc::new(notifier);
    self
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  pub fn cache(&self) -> &Arc<dyn CacheStore> {
    &self.cache
  }

  /// Execute `graph`.
  ///
  /// Fails only when the graph or the options are invalid, in which case
  /// nothing runs. Node failures are reported in the returned [`RunReport`].
  #[instrument(
    name = "executor_run",
    skip(self, graph, strategy, options, cancel),
    fields(strategy = %strategy, nodes = graph.len())
  )]
  pub async fn run(
    &self,
    graph: &Graph,
    strategy: Strategy,
    options: RunOptions,
    cancel: CancellationToken,
  ) -> Result<RunReport, ExecutorError> {
    options.validate()?;
    graph
      .validate()
      .map_err(|errors| ExecutorError::InvalidGraph { errors })?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let mode = if options.dry_run {
      Mode::DryRun
    } else if options.refresh_hashes {
      Mode::Refresh
    } else {
      Mode::Execute
    };
    let limit = match strategy {
      Strategy::Sequential => 1,
      _ => options.workers(),
    };
    let remote = match &strategy {
      Strategy::Distributed(config) => Some(config.clone()),
      _ => None,
    };

    info!(run_id = %run_id, mode = ?mode, workers = limit, "run_started");
    self.notifier.notify(ExecutionEvent::RunStarted {
      run_id: run_id.clone(),
    });

    let shared = Arc::new(RunShared {
      run_id: run_id.clone(),
      mode,
      options,
      cache: self.cache.clone(),
      crashes: CrashStore::new(&self.config.crash_dir),
      notifier: self.notifier.clone(),
      remote,
      cancel: cancel.clone(),
    });

    let mut state = RunState::new(graph, self.config.work_root.clone());
    let mut tasks: JoinSet<Result<Finished, ExecutorError>> = JoinSet::new();

    loop {
      if cancel.is_cancelled() {
        state.cancelled = true;
        state.cancel_queued(graph, &shared).await?;
      } else {
        state.advance(graph, &shared).await?;
      }

      if matches!(strategy, Strategy::Sequential) {
        match state.ready.pop_front() {
          Some(node) => {
            let finished = execute_instance(shared.clone(), node).await?;
            state.finish(graph, &shared, finished).await?;
            continue;
          }
          None => break,
        }
      }

      while tasks.len() < limit
        && !cancel.is_cancelled()
        && let Some(node) = state.ready.pop_front()
      {
        tasks.spawn(execute_instance(shared.clone(), node));
      }

      if tasks.is_empty() {
        if state.ready.is_empty() {
          break;
        }
        continue;
      }

      tokio::select! {
        joined = tasks.join_next() => {
          if let Some(joined) = joined {
            let finished = joined.map_err(|e| ExecutorError::Join {
              message: e.to_string(),
            })??;
            state.finish(graph, &shared, finished).await?;
          }
        }
        _ = cancel.cancelled(), if !state.cancelled => {
          info!(run_id = %run_id, in_flight = tasks.len(), "run_cancelling");
          state.cancelled = true;
        }
      }
    }

    let report = state.into_report(run_id.clone());
    let success = report.is_success();
    info!(
      run_id = %run_id,
      success,
      cancelled = report.cancelled,
      executed = report.executed(),
      cache_hits = report.cache_hits(),
      "run_finished"
    );
    self.notifier.notify(ExecutionEvent::RunFinished {
      run_id,
      success,
      cancelled: report.cancelled,
    });
    Ok(report)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
  /// Upstream not settled yet.
  Waiting,
  /// Instances created and queued or running.
  Expanded,
  Done,
  Failed,
  Skipped,
  Cancelled,
  /// A dry run or refresh could not settle the node.
  Planned,
}

#[derive(Debug)]
struct NodeRun {
  status: Status,
  expected: usize,
  finished: Vec<Finished>,
  outputs: Option<OutputSet>,
  error: Option<String>,
  blocked_by: Vec<String>,
  crash_records: Vec<PathBuf>,
}

impl NodeRun {
  fn new() -> Self {
    Self {
      status: Status::Waiting,
      expected: 0,
      finished: Vec::new(),
      outputs: None,
      error: None,
      blocked_by: Vec::new(),
      crash_records: Vec::new(),
    }
  }
}

struct RunState {
  order: Vec<String>,
  nodes: HashMap<String, NodeRun>,
  collected: HashMap<String, OutputSet>,
  ready: VecDeque<Node>,
  work_root: PathBuf,
  cancelled: bool,
}

impl RunState {
  fn new(graph: &Graph, work_root: PathBuf) -> Self {
    let order = graph.topological_order();
    let nodes = order.iter().map(|id| (id.clone(), NodeRun::new())).collect();
    Self {
      order,
      nodes,
      collected: HashMap::new(),
      ready: VecDeque::new(),
      work_root,
      cancelled: false,
    }
  }

  fn status(&self, node_id: &str) -> Status {
    self
      .nodes
      .get(node_id)
      .map(|n| n.status)
      .unwrap_or(Status::Waiting)
  }

  fn node_mut(&mut self, node_id: &str) -> Result<&mut NodeRun, ExecutorError> {
    self
      .nodes
      .get_mut(node_id)
      .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()).into())
  }

  /// Settle every waiting node whose upstream allows it. One pass in
  /// topological order reaches a fixed point.
  async fn advance(&mut self, graph: &Graph, shared: &RunShared) -> Result<(), ExecutorError> {
    for node_id in self.order.clone() {
      if self.status(&node_id) != Status::Waiting {
        continue;
      }

      let upstream = graph.upstream(&node_id);
      let statuses: Vec<Status> = upstream.iter().map(|u| self.status(u)).collect();

      if statuses
        .iter()
        .any(|s| matches!(s, Status::Failed | Status::Skipped))
      {
        let blocked_by: Vec<String> = upstream
          .iter()
          .filter(|u| matches!(self.status(u), Status::Failed | Status::Skipped))
          .cloned()
          .collect();
        self.skip(&node_id, blocked_by, shared)?;
      } else if statuses.contains(&Status::Cancelled) {
        self.node_mut(&node_id)?.status = Status::Cancelled;
      } else if statuses.iter().all(|s| *s == Status::Done) {
        self.expand(graph, &node_id, shared).await?;
      } else if statuses
        .iter()
        .all(|s| matches!(s, Status::Done | Status::Planned))
      {
        self.node_mut(&node_id)?.status = Status::Planned;
      }
    }
    Ok(())
  }

  fn skip(&mut self, node_id: &str, blocked_by: Vec<String>, shared: &RunShared) -> Result<(), ExecutorError> {
    let mut inherited: Vec<PathBuf> = blocked_by
      .iter()
      .filter_map(|u| self.nodes.get(u))
      .flat_map(|n| n.crash_records.iter().cloned())
      .collect();
    inherited.dedup();

    warn!(node_id = %node_id, blocked_by = ?blocked_by, "node_skipped");
    shared.notifier.notify(ExecutionEvent::NodeSkipped {
      run_id: shared.run_id.clone(),
      node_id: node_id.to_string(),
      blocked_by: blocked_by.clone(),
    });

    let run = self.node_mut(node_id)?;
    run.status = Status::Skipped;
    run.error = Some(format!("blocked by failed upstream: {}", blocked_by.join(", ")));
    run.blocked_by = blocked_by;
    run.crash_records = inherited;
    Ok(())
  }

  async fn expand(&mut self, graph: &Graph, node_id: &str, shared: &RunShared) -> Result<(), ExecutorError> {
    let spec = graph
      .node(node_id)
      .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))?
      .clone();

    let bound = match graph.bind_inputs(node_id, &self.collected) {
      Ok(bound) => bound,
      Err(WorkflowError::UpstreamElementFailed { field, .. }) => {
        let blocked_by = graph
          .incoming(node_id)
          .filter(|e| e.input == field)
          .map(|e| e.from.clone())
          .collect();
        return self.skip(node_id, blocked_by, shared);
      }
      Err(e) => return self.fail_node(node_id, &spec.params, e, shared).await,
    };

    let iterables = graph.iterable_fields(node_id);
    let work_root = self.work_root.clone();
    let params = spec.params.clone();
    let expanded = tokio::task::spawn_blocking(move || fanout::expand(&spec, &bound, &iterables, &work_root))
      .await
      .map_err(|e| ExecutorError::Join {
        message: e.to_string(),
      })?;

    let instances = match expanded {
      Ok(instances) => instances,
      Err(e) => return self.fail_node(node_id, &params, e, shared).await,
    };

    info!(node_id = %node_id, instances = instances.len(), "node_expanded");

    let mut settled = Vec::new();
    let expected = instances.len();
    for mut node in instances {
      if node.state() == NodeState::Skipped {
        settled.push(Finished {
          node,
          cache: CacheOutcome::Unknown,
          executed: false,
          crash_record: None,
        });
      } else {
        node.transition(NodeState::Ready)?;
        self.ready.push_back(node);
      }
    }

    let run = self.node_mut(node_id)?;
    run.status = Status::Expanded;
    run.expected = expected;
    run.finished.extend(settled);
    if run.finished.len() == run.expected {
      self.finalize(graph, node_id, shared)?;
    }
    Ok(())
  }

  /// The node as a whole could not be expanded.
  async fn fail_node(
    &mut self,
    node_id: &str,
    params: &BTreeMap<String, Value>,
    err: WorkflowError,
    shared: &RunShared,
  ) -> Result<(), ExecutorError> {
    error!(node_id = %node_id, error = %err, "node_failed");

    let mut crash_records = Vec::new();
    if shared.mode == Mode::Execute {
      let record = CrashRecord {
        run_id: shared.run_id.clone(),
        node_id: node_id.to_string(),
        instance_id: node_id.to_string(),
        unit: String::new(),
        fingerprint: None,
        params: ParameterSet::from(params.clone()),
        error_kind: "workflow".to_string(),
        message: err.to_string(),
        workdir: self.work_root.join(node_id),
        occurred_at: Utc::now(),
      };
      match shared.crashes.write(record).await {
        Ok(path) => crash_records.push(path),
        Err(e) => error!(node_id = %node_id, error = %e, "crash_record_write_failed"),
      }
    }

    shared.notifier.notify(ExecutionEvent::NodeFailed {
      run_id: shared.run_id.clone(),
      node_id: node_id.to_string(),
      instance_id: node_id.to_string(),
      error: err.to_string(),
    });

    let run = self.node_mut(node_id)?;
    run.status = Status::Failed;
    run.error = Some(err.to_string());
    run.crash_records = crash_records;
    Ok(())
  }

  async fn finish(&mut self, graph: &Graph, shared: &RunShared, finished: Finished) -> Result<(), ExecutorError> {
    let node_id = finished.node.node_id.clone();
    let run = self.node_mut(&node_id)?;
    run.finished.push(finished);
    if run.finished.len() == run.expected {
      self.finalize(graph, &node_id, shared)?;
    }
    Ok(())
  }

  fn finalize(&mut self, graph: &Graph, node_id: &str, shared: &RunShared) -> Result<(), ExecutorError> {
    let spec = graph
      .node(node_id)
      .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))?;
    let run = self
      .nodes
      .get_mut(node_id)
      .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))?;

    run.finished.sort_by_key(|f| f.node.index);
    run.crash_records = run
      .finished
      .iter()
      .filter_map(|f| f.crash_record.clone())
      .collect();

    let states: Vec<NodeState> = run.finished.iter().map(|f| f.node.state()).collect();
    if states.contains(&NodeState::Cancelled) {
      run.status = Status::Cancelled;
      return Ok(());
    }
    if states.contains(&NodeState::Ready) {
      run.status = Status::Planned;
      return Ok(());
    }

    let nodes: Vec<Node> = run.finished.iter().map(|f| f.node.clone()).collect();
    match fanout::collect(spec, &nodes, shared.options.fan_out_policy) {
      Ok(outputs) => {
        info!(node_id = %node_id, instances = nodes.len(), "node_done");
        run.status = Status::Done;
        run.outputs = Some(outputs.clone());
        self.collected.insert(node_id.to_string(), outputs);
      }
      Err(e) => {
        run.status = Status::Failed;
        run.error = match nodes.as_slice() {
          [single] if single.index.is_none() => single.error.as_ref().map(|f| f.message.clone()),
          _ => None,
        }
        .or_else(|| Some(e.to_string()));
        if let WorkflowError::PartialFanOutFailure { .. } = e
          && nodes.iter().any(|n| n.index.is_some())
        {
          error!(node_id = %node_id, error = %e, "fan_out_failed");
          shared.notifier.notify(ExecutionEvent::NodeFailed {
            run_id: shared.run_id.clone(),
            node_id: node_id.to_string(),
            instance_id: node_id.to_string(),
            error: e.to_string(),
          });
        }
      }
    }
    Ok(())
  }

  /// Cancel everything still queued.
  async fn cancel_queued(&mut self, graph: &Graph, shared: &RunShared) -> Result<(), ExecutorError> {
    while let Some(mut node) = self.ready.pop_front() {
      node.transition(NodeState::Cancelled)?;
      let finished = Finished {
        node,
        cache: CacheOutcome::Unknown,
        executed: false,
        crash_record: None,
      };
      self.finish(graph, shared, finished).await?;
    }
    Ok(())
  }

  fn into_report(mut self, run_id: String) -> RunReport {
    let cancelled = self.cancelled;
    let nodes = self
      .order
      .iter()
      .filter_map(|node_id| {
        let run = self.nodes.remove(node_id)?;
        let state = match run.status {
          Status::Done => NodeState::Done,
          Status::Failed => NodeState::Failed,
          Status::Skipped => NodeState::Skipped,
          Status::Cancelled => NodeState::Cancelled,
          Status::Waiting | Status::Expanded if cancelled => NodeState::Cancelled,
          Status::Waiting | Status::Expanded | Status::Planned => NodeState::Pending,
        };
        let instances: Vec<InstanceReport> = run
          .finished
          .into_iter()
          .map(|f| InstanceReport {
            instance_id: f.node.id.clone(),
            index: f.node.index,
            state: f.node.state(),
            fingerprint: f.node.fingerprint.clone(),
            cache: f.cache,
            executed: f.executed,
            workdir: f.node.workdir.clone(),
            error: f.node.error.clone().or_else(|| instance_failure(&f.node)),
            crash_record: f.crash_record,
          })
          .collect();
        Some(NodeReport {
          node_id: node_id.clone(),
          state,
          cache: NodeReport::summarize(&instances),
          outputs: run.outputs,
          error: run.error,
          blocked_by: run.blocked_by,
          crash_records: run.crash_records,
          instances,
        })
      })
      .collect();

    RunReport {
      run_id,
      nodes,
      cancelled,
    }
  }
}

fn instance_failure(node: &Node) -> Option<NodeFailure> {
  match node.state() {
    NodeState::Cancelled => Some(NodeFailure::new("cancelled", "cancelled before completion")),
    _ => None,
  }
}
