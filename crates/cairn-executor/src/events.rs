//! Execution events and notifiers.
//!
//! Events are emitted while a run progresses so callers can follow it, log
//! it, or stream it somewhere else.

use cairn_params::Fingerprint;
use cairn_unit::OutputSet;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  RunStarted {
    run_id: String,
  },

  /// An instance missed the cache and its unit is being invoked.
  NodeStarted {
    run_id: String,
    node_id: String,
    instance_id: String,
  },

  /// An instance was answered from the cache (or refreshed into it).
  NodeCached {
    run_id: String,
    node_id: String,
    instance_id: String,
    fingerprint: Fingerprint,
  },

  NodeCompleted {
    run_id: String,
    node_id: String,
    instance_id: String,
    outputs: OutputSet,
  },

  /// An instance failed, or the node as a whole failed to expand or collect.
  NodeFailed {
    run_id: String,
    node_id: String,
    instance_id: String,
    error: String,
  },

  NodeSkipped {
    run_id: String,
    node_id: String,
    blocked_by: Vec<String>,
  },

  RunFinished {
    run_id: String,
    success: bool,
    cancelled: bool,
  },
}

/// Receives execution events.
///
/// Called inline from the executor; implementations must not block.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls scheduling. Volume is a few
  // events per instance.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with its receiving end.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // The receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_channel_notifier_delivers_in_order() {
    let (notifier, mut rx) = ChannelNotifier::channel();
    notifier.notify(ExecutionEvent::RunStarted {
      run_id: "r".to_string(),
    });
    notifier.notify(ExecutionEvent::RunFinished {
      run_id: "r".to_string(),
      success: true,
      cancelled: false,
    });

    assert!(matches!(rx.try_recv().unwrap(), ExecutionEvent::RunStarted { .. }));
    assert!(matches!(rx.try_recv().unwrap(), ExecutionEvent::RunFinished { success: true, .. }));
  }

  #[test]
  fn test_channel_notifier_ignores_dropped_receiver() {
    let (notifier, rx) = ChannelNotifier::channel();
    drop(rx);
    notifier.notify(ExecutionEvent::RunStarted {
      run_id: "r".to_string(),
    });
  }

  #[test]
  fn test_event_serialization_is_tagged() {
    let event = ExecutionEvent::NodeSkipped {
      run_id: "r".to_string(),
      node_id: "b".to_string(),
      blocked_by: vec!["a".to_string()],
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "node_skipped");
    assert_eq!(json["blocked_by"][0], "a");
  }
}
