use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cairn_cache::{CacheStore, FsCacheStore};
use cairn_config::PipelineDef;
use cairn_executor::{
  DistributedConfig, Executor, ExecutorConfig, LocalJobQueue, RunOptions, RunReport, Strategy,
};
use cairn_params::Fingerprint;
use cairn_workflow::FanOutPolicy;

/// Cairn - a content-addressed workflow engine
#[derive(Parser)]
#[command(name = "cairn")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.cairn)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline, reusing cached results
  Run {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,

    #[arg(long, value_enum, default_value_t = StrategyArg::LocalParallel)]
    strategy: StrategyArg,

    /// Concurrency bound (default: available parallelism)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Node id, instance id, or fingerprint to re-execute. Repeatable.
    #[arg(long)]
    force: Vec<String>,

    #[arg(long, value_enum, default_value_t = PolicyArg::FailAll)]
    fan_out_policy: PolicyArg,
  },

  /// Show what a run would execute without running anything
  Plan {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },

  /// Re-register results after the data directory or inputs moved
  Refresh {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },

  /// Drop one cache entry
  Invalidate {
    fingerprint: String,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
  Sequential,
  LocalParallel,
  /// Through the in-process job queue
  Distributed,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
  FailAll,
  MarkErrors,
}

impl From<PolicyArg> for FanOutPolicy {
  fn from(arg: PolicyArg) -> Self {
    match arg {
      PolicyArg::FailAll => FanOutPolicy::FailAll,
      PolicyArg::MarkErrors => FanOutPolicy::MarkErrors,
    }
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".cairn"),
  };

  let rt = tokio::runtime::Runtime::new()?;
  match cli.command {
    Some(Commands::Run {
      pipeline_file,
      strategy,
      max_workers,
      force,
      fan_out_policy,
    }) => {
      let strategy = match strategy {
        StrategyArg::Sequential => Strategy::Sequential,
        StrategyArg::LocalParallel => Strategy::LocalParallel,
        StrategyArg::Distributed => Strategy::Distributed(DistributedConfig::new(Arc::new(LocalJobQueue::new()))),
      };
      let options = RunOptions {
        force: force.into_iter().collect::<HashSet<_>>(),
        max_workers,
        fan_out_policy: fan_out_policy.into(),
        ..RunOptions::default()
      };
      let report = rt.block_on(run_pipeline(&pipeline_file, &data_dir, strategy, options))?;
      if !report.is_success() {
        bail!("run {} did not complete successfully", report.run_id);
      }
    }
    Some(Commands::Plan { pipeline_file }) => {
      let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
      };
      rt.block_on(run_pipeline(&pipeline_file, &data_dir, Strategy::Sequential, options))?;
    }
    Some(Commands::Refresh { pipeline_file }) => {
      let options = RunOptions {
        refresh_hashes: true,
        ..RunOptions::default()
      };
      rt.block_on(run_pipeline(&pipeline_file, &data_dir, Strategy::Sequential, options))?;
    }
    Some(Commands::Invalidate { fingerprint }) => {
      rt.block_on(invalidate(&fingerprint, &data_dir))?;
    }
    None => {
      println!("cairn - use --help to see available commands");
    }
  }

  Ok(())
}

fn init_tracing(verbose: u8) {
  let level = match verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

async fn run_pipeline(
  pipeline_file: &Path,
  data_dir: &Path,
  strategy: Strategy,
  options: RunOptions,
) -> Result<RunReport> {
  let pipeline = PipelineDef::load(pipeline_file)
    .with_context(|| format!("failed to load pipeline: {}", pipeline_file.display()))?;
  let graph = pipeline
    .build()
    .with_context(|| format!("failed to build pipeline: {}", pipeline.name))?;

  info!(pipeline = %pipeline.name, nodes = graph.len(), "pipeline_loaded");

  let cache = Arc::new(FsCacheStore::new(data_dir.join("cache")));
  let config = ExecutorConfig {
    work_root: data_dir.join("work").join(&pipeline.name),
    crash_dir: data_dir.join("crashes").join(&pipeline.name),
  };
  let executor = Executor::new(config, cache);

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, cancelling run");
      on_signal.cancel();
    }
  });

  let report = executor
    .run(&graph, strategy, options, cancel)
    .await
    .context("pipeline run failed")?;

  eprintln!(
    "Run {}: {} executed, {} cached",
    report.run_id,
    report.executed(),
    report.cache_hits()
  );
  println!("{}", serde_json::to_string_pretty(&report)?);

  Ok(report)
}

async fn invalidate(fingerprint: &str, data_dir: &Path) -> Result<()> {
  let fingerprint: Fingerprint = fingerprint.parse().context("invalid fingerprint")?;
  let cache = FsCacheStore::new(data_dir.join("cache"));
  if cache
    .invalidate(&fingerprint)
    .await
    .context("failed to invalidate cache entry")?
  {
    eprintln!("Invalidated {}", fingerprint);
  } else {
    eprintln!("No cache entry for {}", fingerprint);
  }
  Ok(())
}
