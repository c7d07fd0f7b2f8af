use std::path::{Path, PathBuf};

use cairn_params::{Fingerprint, Identity};
use cairn_unit::OutputSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CacheError;

/// A completed result, as persisted in the cache and in the result marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub fingerprint: Fingerprint,
  pub identity: Identity,
  pub outputs: OutputSet,
  pub workdir: PathBuf,
  pub completed_at: DateTime<Utc>,
  /// SHA-256 over every other field.
  pub checksum: String,
}

impl CacheEntry {
  pub fn new(fingerprint: Fingerprint, identity: Identity, outputs: OutputSet, workdir: PathBuf) -> Self {
    let mut entry = Self {
      fingerprint,
      identity,
      outputs,
      workdir,
      completed_at: Utc::now(),
      checksum: String::new(),
    };
    entry.checksum = entry.compute_checksum();
    entry
  }

  pub fn compute_checksum(&self) -> String {
    let body = (
      &self.fingerprint,
      &self.identity,
      &self.outputs,
      &self.workdir,
      &self.completed_at,
    );
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
  }

  /// Parse and verify an entry read from `path`.
  pub fn decode(path: &Path, bytes: &[u8]) -> Result<Self, CacheError> {
    let entry: CacheEntry = serde_json::from_slice(bytes).map_err(|e| CacheError::Corrupt {
      path: path.to_path_buf(),
      reason: e.to_string(),
    })?;
    if entry.checksum != entry.compute_checksum() {
      return Err(CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: "checksum mismatch".to_string(),
      });
    }
    Ok(entry)
  }
}
