use std::path::PathBuf;

use cairn_params::Fingerprint;
use cairn_unit::OutputSet;
use cairn_workflow::{NodeFailure, NodeState};
use serde::{Deserialize, Serialize};

/// How the cache answered for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
  /// Not looked up: inputs unknown, or the instance was skipped.
  Unknown,
  Hit,
  /// A previous result was re-registered under the current fingerprint.
  Refreshed,
  /// No usable entry. The unit ran, unless this is a dry run or refresh.
  Miss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
  pub instance_id: String,
  pub index: Option<usize>,
  pub state: NodeState,
  pub fingerprint: Option<Fingerprint>,
  pub cache: CacheOutcome,
  /// Whether the unit was actually invoked.
  pub executed: bool,
  pub workdir: PathBuf,
  pub error: Option<NodeFailure>,
  pub crash_record: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
  pub node_id: String,
  /// `Pending` when a dry run or refresh could not settle the node.
  pub state: NodeState,
  pub cache: CacheOutcome,
  pub outputs: Option<OutputSet>,
  pub error: Option<String>,
  /// Upstream nodes that kept this one from running.
  pub blocked_by: Vec<String>,
  /// Crash records explaining the failure, including those of failed
  /// ancestors for skipped nodes.
  pub crash_records: Vec<PathBuf>,
  pub instances: Vec<InstanceReport>,
}

impl NodeReport {
  /// Overall cache outcome: the "worst" outcome among the instances.
  pub(crate) fn summarize(instances: &[InstanceReport]) -> CacheOutcome {
    instances
      .iter()
      .map(|i| i.cache)
      .max()
      .unwrap_or(CacheOutcome::Unknown)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  pub run_id: String,
  /// Nodes in topological order.
  pub nodes: Vec<NodeReport>,
  pub cancelled: bool,
}

impl RunReport {
  /// True when every node finished `Done` with no failed instance.
  pub fn is_success(&self) -> bool {
    !self.cancelled
      && self.nodes.iter().all(|n| {
        n.state == NodeState::Done && n.instances.iter().all(|i| i.state == NodeState::Done)
      })
  }

  pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
    self.nodes.iter().find(|n| n.node_id == node_id)
  }

  /// Number of unit invocations.
  pub fn executed(&self) -> usize {
    self
      .nodes
      .iter()
      .flat_map(|n| &n.instances)
      .filter(|i| i.executed)
      .count()
  }

  /// Instances answered from the cache.
  pub fn cache_hits(&self) -> usize {
    self
      .nodes
      .iter()
      .flat_map(|n| &n.instances)
      .filter(|i| i.cache == CacheOutcome::Hit)
      .count()
  }
}
