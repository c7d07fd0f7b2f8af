use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::queue::QueueError;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
  Constant,
  Linear,
  #[default]
  Exponential,
}

/// Retry policy for transient job-queue errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  pub backoff: Backoff,
  pub initial_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      backoff: Backoff::Exponential,
      initial_delay: Duration::from_millis(200),
      max_delay: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// No retries at all.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  /// Delay before retrying after failed attempt number `attempt` (1-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let step = attempt.max(1);
    let delay = match self.backoff {
      Backoff::Constant => self.initial_delay,
      Backoff::Linear => self.initial_delay.saturating_mul(step),
      Backoff::Exponential => self
        .initial_delay
        .saturating_mul(2u32.saturating_pow(step - 1)),
    };
    delay.min(self.max_delay)
  }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, QueueError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, QueueError>>,
{
  let mut attempt = 1;
  loop {
    match op().await {
      Err(e) if e.is_transient() && attempt < policy.max_attempts => {
        let delay = policy.delay(attempt);
        warn!(
          operation,
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "queue_retry"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      other => return other,
    }
  }
}
