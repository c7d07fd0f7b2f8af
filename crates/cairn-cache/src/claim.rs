use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cairn_params::Fingerprint;
use tokio::sync::OwnedMutexGuard;

/// Exclusive hold on one fingerprint.
#[derive(Debug)]
pub struct ClaimGuard {
  fingerprint: Fingerprint,
  _guard: OwnedMutexGuard<()>,
}

impl ClaimGuard {
  pub fn fingerprint(&self) -> &Fingerprint {
    &self.fingerprint
  }
}

/// One async lock per fingerprint currently in use.
///
/// Locks nobody holds or waits on are pruned on the next claim.
#[derive(Debug, Default)]
pub struct ClaimTable {
  locks: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl ClaimTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn claim(&self, fingerprint: &Fingerprint) -> ClaimGuard {
    let lock = {
      let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
      locks.retain(|_, lock| Arc::strong_count(lock) > 1);
      locks.entry(fingerprint.clone()).or_default().clone()
    };
    ClaimGuard {
      fingerprint: fingerprint.clone(),
      _guard: lock.lock_owned().await,
    }
  }

  /// Number of fingerprints with a live lock.
  pub fn active(&self) -> usize {
    let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
      .values()
      .filter(|lock| Arc::strong_count(lock) > 1)
      .count()
  }
}
