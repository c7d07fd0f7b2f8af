//! Cairn Executor
//!
//! Runs a [`Graph`](cairn_workflow::Graph) against a
//! [`CacheStore`](cairn_cache::CacheStore). Each node instance is
//! fingerprinted; instances the cache can answer are not executed.
//!
//! Three strategies share one scheduler:
//!
//! - [`Strategy::Sequential`] runs one instance at a time, in topological
//!   order.
//! - [`Strategy::LocalParallel`] runs ready instances as tokio tasks, bounded
//!   by `max_workers`.
//! - [`Strategy::Distributed`] submits instances to a [`JobQueue`] and polls
//!   for their status, retrying transient queue errors.
//!
//! Failures stay local: the failed node's dependents are skipped, independent
//! branches keep running, and a [`CrashRecord`] is written for each failed
//! instance.

mod crash;
mod error;
mod events;
mod executor;
mod instance;
mod options;
mod queue;
mod report;
mod retry;

pub use crash::{CrashRecord, CrashStore};
pub use error::ExecutorError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use executor::Executor;
pub use options::{DistributedConfig, ExecutorConfig, RunOptions, Strategy};
pub use queue::{JobId, JobQueue, JobSpec, JobStatus, LocalJobQueue, QueueError};
pub use report::{CacheOutcome, InstanceReport, NodeReport, RunReport};
pub use retry::{Backoff, RetryPolicy, with_retry};
