#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cairn_cache::FsCacheStore;
use cairn_executor::{Executor, ExecutorConfig};
use cairn_unit::{OutputSet, ParameterSet, RunContext, UnitError, UnitOfWork, UnitSpec};

type Body = dyn Fn(&ParameterSet, &RunContext) -> Result<OutputSet, UnitError> + Send + Sync;

/// Test unit that counts invocations and tracks peak concurrency.
pub struct TestUnit {
  spec: UnitSpec,
  body: Box<Body>,
  delay: Duration,
  calls: AtomicUsize,
  active: AtomicUsize,
  peak: AtomicUsize,
}

impl TestUnit {
  pub fn new<F>(spec: UnitSpec, body: F) -> Arc<Self>
  where
    F: Fn(&ParameterSet, &RunContext) -> Result<OutputSet, UnitError> + Send + Sync + 'static,
  {
    Self::with_delay(spec, Duration::ZERO, body)
  }

  pub fn with_delay<F>(spec: UnitSpec, delay: Duration, body: F) -> Arc<Self>
  where
    F: Fn(&ParameterSet, &RunContext) -> Result<OutputSet, UnitError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      spec,
      body: Box::new(body),
      delay,
      calls: AtomicUsize::new(0),
      active: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl UnitOfWork for TestUnit {
  fn spec(&self) -> &UnitSpec {
    &self.spec
  }

  async fn run(&self, inputs: &ParameterSet, ctx: &RunContext) -> Result<OutputSet, UnitError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);

    let waited = tokio::select! {
      _ = ctx.cancel.cancelled() => Err(UnitError::Cancelled),
      _ = tokio::time::sleep(self.delay) => Ok(()),
    };

    self.active.fetch_sub(1, Ordering::SeqCst);
    waited?;
    (self.body)(inputs, ctx)
  }
}

/// Scratch data directory with the usual cache/work/crashes layout.
pub struct Fixture {
  pub dir: tempfile::TempDir,
  pub cache: Arc<FsCacheStore>,
  pub executor: Executor,
}

impl Fixture {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let (cache, executor) = executor_at(dir.path());
    Self {
      dir,
      cache,
      executor,
    }
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn path(&self, rel: &str) -> PathBuf {
    self.dir.path().join(rel)
  }
}

pub fn executor_at(root: &Path) -> (Arc<FsCacheStore>, Executor) {
  let cache = Arc::new(FsCacheStore::new(root.join("cache")));
  let executor = Executor::new(
    ExecutorConfig {
      work_root: root.join("work"),
      crash_dir: root.join("crashes"),
    },
    cache.clone(),
  );
  (cache, executor)
}

pub fn str_input(inputs: &ParameterSet, field: &str) -> String {
  inputs
    .get(field)
    .and_then(|v| v.as_str())
    .unwrap_or_default()
    .to_string()
}
