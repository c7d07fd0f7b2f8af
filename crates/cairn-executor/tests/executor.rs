mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cairn_cache::CacheStore;
use cairn_executor::{
  CacheOutcome, ChannelNotifier, CrashStore, DistributedConfig, ExecutionEvent, ExecutorError, JobId, JobQueue,
  JobSpec, JobStatus, LocalJobQueue, QueueError, RetryPolicy, RunOptions, Strategy,
};
use cairn_unit::{FieldType, InputField, OutputSet, UnitError, UnitSpec};
use cairn_workflow::{Edge, FanOutPolicy, Graph, NodeSpec, NodeState};
use common::{Fixture, TestUnit, executor_at, str_input};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn io_failure(e: std::io::Error) -> UnitError {
  UnitError::failed(e.to_string())
}

/// Writes `text` to `out.txt` in its working directory.
fn writer() -> Arc<TestUnit> {
  TestUnit::new(
    UnitSpec::new("write")
      .input(InputField::required("text", FieldType::String))
      .output("file", FieldType::File),
    |inputs, ctx| {
      let path = ctx.workdir.join("out.txt");
      std::fs::write(&path, str_input(inputs, "text")).map_err(io_failure)?;
      Ok(OutputSet::from([("file".to_string(), json!(path.to_string_lossy()))]))
    },
  )
}

/// Copies the content of `source` to `out.txt`.
fn copier() -> Arc<TestUnit> {
  TestUnit::new(
    UnitSpec::new("copy")
      .input(InputField::required("source", FieldType::File))
      .output("file", FieldType::File),
    |inputs, ctx| {
      let path = ctx.workdir.join("out.txt");
      std::fs::copy(str_input(inputs, "source"), &path).map_err(io_failure)?;
      Ok(OutputSet::from([("file".to_string(), json!(path.to_string_lossy()))]))
    },
  )
}

/// Reports the length of `file`.
fn counter() -> Arc<TestUnit> {
  TestUnit::new(
    UnitSpec::new("count")
      .input(InputField::required("file", FieldType::File))
      .output("length", FieldType::Integer),
    |inputs, _| {
      let text = std::fs::read_to_string(str_input(inputs, "file")).map_err(io_failure)?;
      Ok(OutputSet::from([("length".to_string(), json!(text.len()))]))
    },
  )
}

fn chain(a: Arc<TestUnit>, b: Arc<TestUnit>) -> Graph {
  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("a", a).param("text", json!("hello")))
    .unwrap();
  graph.add_node(NodeSpec::new("b", b)).unwrap();
  graph.connect("a", "file", "b", "file").unwrap();
  graph
}

fn run_options() -> RunOptions {
  RunOptions::default()
}

#[tokio::test]
async fn test_chain_runs_then_hits_cache() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());

  let report = f
    .executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(report.executed(), 2);
  let node_b = report.node("b").unwrap();
  assert_eq!(node_b.outputs.as_ref().unwrap()["length"], json!(5));
  assert_eq!(node_b.cache, CacheOutcome::Miss);
  assert!(f.path("work/a/out.txt").is_file());

  let again = f
    .executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(again.is_success());
  assert_eq!(again.executed(), 0);
  assert_eq!(again.cache_hits(), 2);
  assert_eq!(again.node("b").unwrap().outputs, node_b.outputs);
  assert_eq!((a.calls(), b.calls()), (1, 1));
}

#[tokio::test]
async fn test_input_file_content_change_reexecutes() {
  let f = Fixture::new();
  let source = f.path("in.txt");
  std::fs::write(&source, "one").unwrap();

  let (a, b) = (copier(), counter());
  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("a", a.clone()).param("source", json!(source.to_string_lossy())))
    .unwrap();
  graph.add_node(NodeSpec::new("b", b.clone())).unwrap();
  graph.connect("a", "file", "b", "file").unwrap();

  let run = || {
    f.executor
      .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
  };

  run().await.unwrap();
  run().await.unwrap();
  assert_eq!((a.calls(), b.calls()), (1, 1));

  std::fs::write(&source, "three").unwrap();
  let report = run().await.unwrap();
  assert_eq!((a.calls(), b.calls()), (2, 2));
  assert_eq!(report.node("b").unwrap().outputs.as_ref().unwrap()["length"], json!(5));
}

#[tokio::test]
async fn test_failure_skips_dependents_only() {
  let f = Fixture::new();
  let bad = TestUnit::new(
    UnitSpec::new("bad")
      .input(InputField::required("file", FieldType::File))
      .output("length", FieldType::Integer),
    |_, _| Err(UnitError::failed("boom")),
  );
  let after = TestUnit::new(
    UnitSpec::new("after")
      .input(InputField::required("length", FieldType::Integer))
      .output("double", FieldType::Integer),
    |inputs, _| {
      let n = inputs.get("length").and_then(|v| v.as_i64()).unwrap_or_default();
      Ok(OutputSet::from([("double".to_string(), json!(n * 2))]))
    },
  );
  let good = counter();

  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("src", writer()).param("text", json!("hello")))
    .unwrap();
  graph.add_node(NodeSpec::new("good", good.clone())).unwrap();
  graph.add_node(NodeSpec::new("bad", bad.clone())).unwrap();
  graph.add_node(NodeSpec::new("after", after.clone())).unwrap();
  graph.connect("src", "file", "good", "file").unwrap();
  graph.connect("src", "file", "bad", "file").unwrap();
  graph.connect("bad", "length", "after", "length").unwrap();

  let report = f
    .executor
    .run(&graph, Strategy::LocalParallel, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(!report.is_success());
  assert_eq!(report.node("good").unwrap().state, NodeState::Done);
  assert_eq!(good.calls(), 1);

  let failed = report.node("bad").unwrap();
  assert_eq!(failed.state, NodeState::Failed);
  assert!(failed.error.as_ref().unwrap().contains("boom"));
  assert_eq!(failed.crash_records.len(), 1);

  let record = CrashStore::read(&failed.crash_records[0]).await.unwrap();
  assert_eq!(record.node_id, "bad");
  assert_eq!(record.error_kind, "failed");
  assert_eq!(record.run_id, report.run_id);
  assert!(record.params.contains("file"));

  let skipped = report.node("after").unwrap();
  assert_eq!(skipped.state, NodeState::Skipped);
  assert_eq!(skipped.blocked_by, vec!["bad".to_string()]);
  assert_eq!(skipped.crash_records, failed.crash_records);
  assert_eq!(after.calls(), 0);

  // Nothing was cached for the failure.
  let fp = failed.instances[0].fingerprint.clone().unwrap();
  assert!(f.cache.lookup(&fp).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_execute_fingerprint_once() {
  let f = Fixture::new();
  let slow = TestUnit::with_delay(
    UnitSpec::new("slow")
      .input(InputField::required("text", FieldType::String))
      .output("text", FieldType::String),
    Duration::from_millis(200),
    |inputs, _| Ok(OutputSet::from([("text".to_string(), json!(str_input(inputs, "text")))])),
  );
  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("slow", slow.clone()).param("text", json!("x")))
    .unwrap();

  let (first, second) = tokio::join!(
    f.executor
      .run(&graph, Strategy::LocalParallel, run_options(), CancellationToken::new()),
    f.executor
      .run(&graph, Strategy::LocalParallel, run_options(), CancellationToken::new()),
  );
  let (first, second) = (first.unwrap(), second.unwrap());

  assert!(first.is_success() && second.is_success());
  assert_eq!(slow.calls(), 1);
  assert_eq!(slow.peak(), 1);
  assert_eq!(first.executed() + second.executed(), 1);
  assert_eq!(first.cache_hits() + second.cache_hits(), 1);
}

#[tokio::test]
async fn test_dry_run_has_no_effect() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());
  let dry = RunOptions {
    dry_run: true,
    ..RunOptions::default()
  };

  let plan = f
    .executor
    .run(&graph, Strategy::Sequential, dry.clone(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!((a.calls(), b.calls()), (0, 0));
  assert!(f.cache.entries().await.unwrap().is_empty());
  let node_a = plan.node("a").unwrap();
  assert_eq!(node_a.cache, CacheOutcome::Miss);
  assert_eq!(node_a.state, NodeState::Pending);
  assert!(node_a.instances[0].fingerprint.is_some());
  // b depends on outputs a has not produced.
  assert_eq!(plan.node("b").unwrap().state, NodeState::Pending);
  assert!(!f.path("work/a").exists());

  f.executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();
  let entries = f.cache.entries().await.unwrap().len();

  let plan = f
    .executor
    .run(&graph, Strategy::Sequential, dry, CancellationToken::new())
    .await
    .unwrap();
  assert!(plan.is_success());
  assert_eq!(plan.cache_hits(), 2);
  assert_eq!((a.calls(), b.calls()), (1, 1));
  assert_eq!(f.cache.entries().await.unwrap().len(), entries);
}

fn pair_unit() -> Arc<TestUnit> {
  TestUnit::new(
    UnitSpec::new("pair")
      .input(InputField::required("a", FieldType::Integer))
      .input(InputField::required("b", FieldType::String))
      .output("label", FieldType::String),
    |inputs, _| {
      let a = inputs.get("a").cloned().unwrap_or_default();
      Ok(OutputSet::from([(
        "label".to_string(),
        json!(format!("{}{}", a, str_input(inputs, "b"))),
      )]))
    },
  )
}

fn joiner() -> Arc<TestUnit> {
  TestUnit::new(
    UnitSpec::new("join")
      .input(InputField::required("labels", FieldType::list_of(FieldType::String)))
      .output("joined", FieldType::String),
    |inputs, _| {
      let labels: Vec<String> = inputs
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|items| {
          items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
        })
        .unwrap_or_default();
      Ok(OutputSet::from([("joined".to_string(), json!(labels.join(",")))]))
    },
  )
}

#[tokio::test]
async fn test_fan_out_is_row_major() {
  let f = Fixture::new();
  let pair = pair_unit();
  let mut graph = Graph::new();
  graph
    .add_node(
      NodeSpec::new("pair", pair.clone())
        .iterate("a", vec![json!(1), json!(2)])
        .iterate("b", vec![json!("x"), json!("y"), json!("z")]),
    )
    .unwrap();
  graph.add_node(NodeSpec::new("join", joiner())).unwrap();
  graph.connect("pair", "label", "join", "labels").unwrap();

  let report = f
    .executor
    .run(&graph, Strategy::LocalParallel, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(pair.calls(), 6);
  let node = report.node("pair").unwrap();
  let ids: Vec<&str> = node.instances.iter().map(|i| i.instance_id.as_str()).collect();
  assert_eq!(ids, ["pair.0", "pair.1", "pair.2", "pair.3", "pair.4", "pair.5"]);
  assert_eq!(
    node.outputs.as_ref().unwrap()["label"],
    json!(["1x", "1y", "1z", "2x", "2y", "2z"])
  );
  assert!(f.path("work/pair/_4").is_dir());
  assert_eq!(
    report.node("join").unwrap().outputs.as_ref().unwrap()["joined"],
    json!("1x,1y,1z,2x,2y,2z")
  );
}

fn square_and_double() -> (Graph, Arc<TestUnit>, Arc<TestUnit>) {
  let square = TestUnit::new(
    UnitSpec::new("square")
      .input(InputField::required("n", FieldType::Integer))
      .output("result", FieldType::Integer),
    |inputs, _| {
      let n = inputs.get("n").and_then(|v| v.as_i64()).unwrap_or_default();
      if n == 2 {
        return Err(UnitError::failed("two is not allowed"));
      }
      Ok(OutputSet::from([("result".to_string(), json!(n * n))]))
    },
  );
  let double = TestUnit::new(
    UnitSpec::new("double")
      .input(InputField::required("n", FieldType::Integer))
      .output("result", FieldType::Integer),
    |inputs, _| {
      let n = inputs.get("n").and_then(|v| v.as_i64()).unwrap_or_default();
      Ok(OutputSet::from([("result".to_string(), json!(n * 2))]))
    },
  );

  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("square", square.clone()).iterate("n", vec![json!(1), json!(2), json!(3)]))
    .unwrap();
  graph.add_node(NodeSpec::new("double", double.clone())).unwrap();
  graph
    .connect_edge(Edge::new("square", "result", "double", "n").iterable())
    .unwrap();
  (graph, square, double)
}

#[tokio::test]
async fn test_fan_out_failure_fails_whole_node_by_default() {
  let f = Fixture::new();
  let (graph, square, double) = square_and_double();

  let report = f
    .executor
    .run(&graph, Strategy::LocalParallel, run_options(), CancellationToken::new())
    .await
    .unwrap();

  let node = report.node("square").unwrap();
  assert_eq!(node.state, NodeState::Failed);
  assert_eq!(square.calls(), 3);
  assert_eq!(node.crash_records.len(), 1);
  assert_eq!(node.instances[1].state, NodeState::Failed);
  assert_eq!(report.node("double").unwrap().state, NodeState::Skipped);
  assert_eq!(double.calls(), 0);
}

#[tokio::test]
async fn test_mark_errors_skips_only_affected_combinations() {
  let f = Fixture::new();
  let (graph, _square, double) = square_and_double();
  let options = RunOptions {
    fan_out_policy: FanOutPolicy::MarkErrors,
    ..RunOptions::default()
  };

  let report = f
    .executor
    .run(&graph, Strategy::LocalParallel, options, CancellationToken::new())
    .await
    .unwrap();

  let square = report.node("square").unwrap();
  assert_eq!(square.state, NodeState::Done);
  let results = &square.outputs.as_ref().unwrap()["result"];
  assert_eq!(results[0], json!(1));
  assert_eq!(results[1]["$index"], json!(1));
  assert!(results[1]["$error"].as_str().unwrap().contains("two is not allowed"));
  assert_eq!(results[2], json!(9));

  let node = report.node("double").unwrap();
  let states: Vec<NodeState> = node.instances.iter().map(|i| i.state).collect();
  assert_eq!(states, [NodeState::Done, NodeState::Skipped, NodeState::Done]);
  assert_eq!(double.calls(), 2);
  assert_eq!(node.outputs.as_ref().unwrap()["result"][2], json!(18));
  assert!(!report.is_success());
}

#[tokio::test]
async fn test_parallel_respects_max_workers() {
  let f = Fixture::new();
  let work = TestUnit::with_delay(
    UnitSpec::new("work")
      .input(InputField::required("n", FieldType::Integer))
      .output("n", FieldType::Integer),
    Duration::from_millis(40),
    |inputs, _| Ok(OutputSet::from([("n".to_string(), inputs.get("n").cloned().unwrap_or_default())])),
  );
  let mut graph = Graph::new();
  graph
    .add_node(NodeSpec::new("work", work.clone()).iterate("n", (0..6).map(|n| json!(n)).collect()))
    .unwrap();

  let options = RunOptions {
    max_workers: Some(2),
    ..RunOptions::default()
  };
  let report = f
    .executor
    .run(&graph, Strategy::LocalParallel, options, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(work.calls(), 6);
  assert!(work.peak() <= 2);
}

/// Fails the first `failures` submits as unavailable.
struct FlakyQueue {
  inner: LocalJobQueue,
  failures: AtomicUsize,
  attempts: AtomicUsize,
}

#[async_trait]
impl JobQueue for FlakyQueue {
  async fn submit(&self, job: JobSpec) -> Result<JobId, QueueError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    if self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
    {
      return Err(QueueError::Unavailable {
        message: "try later".to_string(),
      });
    }
    self.inner.submit(job).await
  }

  async fn poll(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
    self.inner.poll(job_id).await
  }

  async fn cancel(&self, job_id: &JobId) -> Result<(), QueueError> {
    self.inner.cancel(job_id).await
  }
}

fn fast_retry() -> RetryPolicy {
  RetryPolicy {
    initial_delay: Duration::from_millis(1),
    max_delay: Duration::from_millis(5),
    ..RetryPolicy::default()
  }
}

#[tokio::test]
async fn test_distributed_retries_transient_submit_errors() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());
  let queue = Arc::new(FlakyQueue {
    inner: LocalJobQueue::new(),
    failures: AtomicUsize::new(2),
    attempts: AtomicUsize::new(0),
  });
  let strategy = Strategy::Distributed(
    DistributedConfig::new(queue.clone())
      .with_retry(fast_retry())
      .with_poll_interval(Duration::from_millis(5)),
  );

  let report = f
    .executor
    .run(&graph, strategy, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(report.node("b").unwrap().outputs.as_ref().unwrap()["length"], json!(5));
  assert_eq!(queue.attempts.load(Ordering::SeqCst), 4);
  assert_eq!(queue.inner.submitted(), 2);
  assert_eq!((a.calls(), b.calls()), (1, 1));
}

#[tokio::test]
async fn test_distributed_gives_up_after_retries() {
  let f = Fixture::new();
  let graph = chain(writer(), counter());
  let queue = Arc::new(FlakyQueue {
    inner: LocalJobQueue::new(),
    failures: AtomicUsize::new(usize::MAX),
    attempts: AtomicUsize::new(0),
  });
  let retry = RetryPolicy {
    max_attempts: 3,
    ..fast_retry()
  };
  let strategy = Strategy::Distributed(DistributedConfig::new(queue.clone()).with_retry(retry));

  let report = f
    .executor
    .run(&graph, strategy, run_options(), CancellationToken::new())
    .await
    .unwrap();

  let node = report.node("a").unwrap();
  assert_eq!(node.state, NodeState::Failed);
  assert_eq!(node.instances[0].error.as_ref().unwrap().kind, "queue");
  assert_eq!(queue.attempts.load(Ordering::SeqCst), 3);
  assert_eq!(report.node("b").unwrap().state, NodeState::Skipped);
}

#[tokio::test]
async fn test_cancellation_stores_nothing() {
  let f = Fixture::new();
  let slow = TestUnit::with_delay(
    UnitSpec::new("slow")
      .input(InputField::required("text", FieldType::String))
      .output("file", FieldType::File),
    Duration::from_secs(30),
    |_, ctx| Ok(OutputSet::from([("file".to_string(), json!(ctx.workdir.to_string_lossy()))])),
  );
  let b = counter();
  let graph = chain(slow.clone(), b.clone());

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let report = tokio::time::timeout(
    Duration::from_secs(5),
    f.executor.run(&graph, Strategy::LocalParallel, run_options(), cancel),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(report.cancelled);
  assert!(!report.is_success());
  assert_eq!(slow.calls(), 1);
  assert_eq!(report.node("a").unwrap().state, NodeState::Cancelled);
  assert_eq!(report.node("b").unwrap().state, NodeState::Cancelled);
  assert_eq!(b.calls(), 0);
  assert!(f.cache.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_cancellation_stores_nothing() {
  let f = Fixture::new();
  let slow = TestUnit::with_delay(
    UnitSpec::new("slow")
      .input(InputField::required("text", FieldType::String))
      .output("file", FieldType::File),
    Duration::from_secs(30),
    |_, ctx| Ok(OutputSet::from([("file".to_string(), json!(ctx.workdir.to_string_lossy()))])),
  );
  let b = counter();
  let graph = chain(slow.clone(), b.clone());

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let report = tokio::time::timeout(
    Duration::from_secs(5),
    f.executor.run(&graph, Strategy::Sequential, run_options(), cancel),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(report.cancelled);
  assert_eq!(report.node("a").unwrap().state, NodeState::Cancelled);
  assert_eq!(report.node("b").unwrap().state, NodeState::Cancelled);
  assert_eq!(b.calls(), 0);
  assert!(f.cache.entries().await.unwrap().is_empty());
}

/// Accepts jobs and reports them running until they are cancelled.
#[derive(Default)]
struct StuckQueue {
  submitted: Mutex<Vec<JobId>>,
  cancelled: Mutex<Vec<JobId>>,
}

impl StuckQueue {
  fn submitted(&self) -> Vec<JobId> {
    self.submitted.lock().unwrap().clone()
  }

  fn cancelled(&self) -> Vec<JobId> {
    self.cancelled.lock().unwrap().clone()
  }
}

#[async_trait]
impl JobQueue for StuckQueue {
  async fn submit(&self, _: JobSpec) -> Result<JobId, QueueError> {
    let mut submitted = self.submitted.lock().unwrap();
    let id = format!("job-{}", submitted.len());
    submitted.push(id.clone());
    Ok(id)
  }

  async fn poll(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
    if self.cancelled.lock().unwrap().contains(job_id) {
      Ok(JobStatus::Failed(UnitError::Cancelled))
    } else {
      Ok(JobStatus::Running)
    }
  }

  async fn cancel(&self, job_id: &JobId) -> Result<(), QueueError> {
    self.cancelled.lock().unwrap().push(job_id.clone());
    Ok(())
  }
}

#[tokio::test]
async fn test_distributed_cancellation_cancels_submitted_jobs() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());
  let queue = Arc::new(StuckQueue::default());
  let strategy = Strategy::Distributed(
    DistributedConfig::new(queue.clone()).with_poll_interval(Duration::from_millis(5)),
  );

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.cancel();
  });

  let report = tokio::time::timeout(
    Duration::from_secs(5),
    f.executor.run(&graph, strategy, run_options(), cancel),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(report.cancelled);
  assert_eq!(report.node("a").unwrap().state, NodeState::Cancelled);
  assert_eq!(report.node("b").unwrap().state, NodeState::Cancelled);
  assert_eq!(queue.submitted(), vec!["job-0".to_string()]);
  assert_eq!(queue.cancelled(), vec!["job-0".to_string()]);
  assert_eq!((a.calls(), b.calls()), (0, 0));
  assert!(f.cache.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_distributed_job_timeout_cancels_job() {
  let f = Fixture::new();
  let graph = chain(writer(), counter());
  let queue = Arc::new(StuckQueue::default());
  let strategy = Strategy::Distributed(
    DistributedConfig::new(queue.clone())
      .with_poll_interval(Duration::from_millis(5))
      .with_job_timeout(Duration::from_millis(30)),
  );

  let report = tokio::time::timeout(
    Duration::from_secs(5),
    f.executor.run(&graph, strategy, run_options(), CancellationToken::new()),
  )
  .await
  .unwrap()
  .unwrap();

  assert!(!report.cancelled);
  let node = report.node("a").unwrap();
  assert_eq!(node.state, NodeState::Failed);
  assert_eq!(node.instances[0].error.as_ref().unwrap().kind, "timeout");
  assert_eq!(node.crash_records.len(), 1);
  assert_eq!(queue.cancelled(), vec!["job-0".to_string()]);
  assert_eq!(report.node("b").unwrap().state, NodeState::Skipped);
}

#[tokio::test]
async fn test_distributed_panicking_unit_fails_with_crash_record() {
  let f = Fixture::new();
  let crash = TestUnit::new(
    UnitSpec::new("crash")
      .input(InputField::required("text", FieldType::String))
      .output("file", FieldType::File),
    |_, _| panic!("tool crashed"),
  );
  let b = counter();
  let graph = chain(crash.clone(), b.clone());
  let queue = Arc::new(LocalJobQueue::new());
  let strategy = Strategy::Distributed(
    DistributedConfig::new(queue.clone()).with_poll_interval(Duration::from_millis(5)),
  );

  let report = tokio::time::timeout(
    Duration::from_secs(5),
    f.executor.run(&graph, strategy, run_options(), CancellationToken::new()),
  )
  .await
  .unwrap()
  .unwrap();

  let node = report.node("a").unwrap();
  assert_eq!(node.state, NodeState::Failed);
  let failure = node.instances[0].error.as_ref().unwrap();
  assert_eq!(failure.kind, "failed");
  assert!(failure.message.contains("tool crashed"));
  assert_eq!(node.crash_records.len(), 1);
  let record = CrashStore::read(&node.crash_records[0]).await.unwrap();
  assert_eq!(record.error_kind, "failed");
  assert_eq!(report.node("b").unwrap().state, NodeState::Skipped);
  assert_eq!(b.calls(), 0);
  assert_eq!(queue.outstanding(), 0);
}

fn relocatable_chain(root: &std::path::Path, a: Arc<TestUnit>, b: Arc<TestUnit>) -> Graph {
  let mut graph = Graph::new();
  let source = root.join("data").join("in.txt");
  graph
    .add_node(NodeSpec::new("a", a).param("source", json!(source.to_string_lossy())))
    .unwrap();
  graph.add_node(NodeSpec::new("b", b)).unwrap();
  graph.connect("a", "file", "b", "file").unwrap();
  graph
}

#[tokio::test]
async fn test_hash_refresh_after_relocation() {
  let dir = tempfile::tempdir().unwrap();
  let old_root = dir.path().join("old");
  let new_root = dir.path().join("new");
  std::fs::create_dir_all(old_root.join("data")).unwrap();
  std::fs::write(old_root.join("data").join("in.txt"), "hello").unwrap();

  let (_, executor) = executor_at(&old_root);
  let graph = relocatable_chain(&old_root, copier(), counter());
  let report = executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(report.executed(), 2);

  std::fs::rename(&old_root, &new_root).unwrap();

  let (a, b) = (copier(), counter());
  let (_, executor) = executor_at(&new_root);
  let graph = relocatable_chain(&new_root, a.clone(), b.clone());
  let refresh = RunOptions {
    refresh_hashes: true,
    ..RunOptions::default()
  };
  let report = executor
    .run(&graph, Strategy::Sequential, refresh, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(report.executed(), 0);
  for node_id in ["a", "b"] {
    assert_eq!(report.node(node_id).unwrap().cache, CacheOutcome::Refreshed);
  }
  let file = report.node("a").unwrap().outputs.as_ref().unwrap()["file"]
    .as_str()
    .unwrap()
    .to_string();
  assert!(file.starts_with(new_root.to_string_lossy().as_ref()));

  let report = executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();
  assert!(report.is_success());
  assert_eq!(report.executed(), 0);
  assert_eq!(report.cache_hits(), 2);
  assert_eq!((a.calls(), b.calls()), (0, 0));
}

#[tokio::test]
async fn test_refresh_does_not_adopt_changed_inputs() {
  let f = Fixture::new();
  std::fs::create_dir_all(f.path("data")).unwrap();
  std::fs::write(f.path("data/in.txt"), "hello").unwrap();

  let a = copier();
  let graph = relocatable_chain(f.root(), a.clone(), counter());
  f.executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  std::fs::write(f.path("data/in.txt"), "changed").unwrap();
  let refresh = RunOptions {
    refresh_hashes: true,
    ..RunOptions::default()
  };
  let report = f
    .executor
    .run(&graph, Strategy::Sequential, refresh, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.node("a").unwrap().cache, CacheOutcome::Miss);
  assert_eq!(report.node("a").unwrap().state, NodeState::Pending);
  assert_eq!(a.calls(), 1);
}

#[tokio::test]
async fn test_corrupt_entry_reexecutes() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());

  let report = f
    .executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();
  let fp = report.node("a").unwrap().instances[0].fingerprint.clone().unwrap();
  std::fs::write(f.cache.entry_path(&fp), b"{\"truncated\":").unwrap();

  let report = f
    .executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(a.calls(), 2);
  // Same content again, so b is still answered from the cache.
  assert_eq!(b.calls(), 1);
  assert!(f.cache.lookup(&fp).await.unwrap().is_some());
}

#[tokio::test]
async fn test_force_reexecutes_node() {
  let f = Fixture::new();
  let (a, b) = (writer(), counter());
  let graph = chain(a.clone(), b.clone());

  f.executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  let forced = RunOptions {
    force: HashSet::from(["a".to_string()]),
    ..RunOptions::default()
  };
  let report = f
    .executor
    .run(&graph, Strategy::Sequential, forced, CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!((a.calls(), b.calls()), (2, 1));
  assert_eq!(report.node("a").unwrap().cache, CacheOutcome::Miss);
  assert_eq!(report.node("b").unwrap().cache, CacheOutcome::Hit);
}

#[tokio::test]
async fn test_invalid_graph_runs_nothing() {
  let f = Fixture::new();
  let a = writer();
  let mut graph = Graph::new();
  graph.add_node(NodeSpec::new("a", a.clone())).unwrap();

  let err = f
    .executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap_err();

  assert!(matches!(err, ExecutorError::InvalidGraph { .. }));
  assert_eq!(a.calls(), 0);
  assert!(!f.path("work").exists());
}

#[tokio::test]
async fn test_conflicting_modes_are_rejected() {
  let f = Fixture::new();
  let graph = chain(writer(), counter());
  let options = RunOptions {
    dry_run: true,
    refresh_hashes: true,
    ..RunOptions::default()
  };

  let err = f
    .executor
    .run(&graph, Strategy::Sequential, options, CancellationToken::new())
    .await
    .unwrap_err();
  assert!(matches!(err, ExecutorError::InvalidOptions { .. }));
}

#[tokio::test]
async fn test_notifier_sees_run_lifecycle() {
  let dir = tempfile::tempdir().unwrap();
  let (notifier, mut rx) = ChannelNotifier::channel();
  let (_, executor) = executor_at(dir.path());
  let executor = executor.with_notifier(notifier);
  let graph = chain(writer(), counter());

  let report = executor
    .run(&graph, Strategy::Sequential, run_options(), CancellationToken::new())
    .await
    .unwrap();

  let mut events = Vec::new();
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }

  assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
  assert!(matches!(
    events.last(),
    Some(ExecutionEvent::RunFinished { success: true, cancelled: false, .. })
  ));
  let completed: Vec<&str> = events
    .iter()
    .filter_map(|e| match e {
      ExecutionEvent::NodeCompleted { instance_id, .. } => Some(instance_id.as_str()),
      _ => None,
    })
    .collect();
  assert_eq!(completed, ["a", "b"]);
  assert!(events.iter().all(|e| match e {
    ExecutionEvent::RunStarted { run_id } | ExecutionEvent::RunFinished { run_id, .. } => *run_id == report.run_id,
    _ => true,
  }));
}
