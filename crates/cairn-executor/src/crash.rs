//! Durable crash records for failed instances.

use std::path::{Path, PathBuf};

use cairn_cache::{CacheError, write_json_atomic};
use cairn_params::Fingerprint;
use cairn_unit::ParameterSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What is known about a failed instance: enough to reproduce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
  pub run_id: String,
  pub node_id: String,
  pub instance_id: String,
  pub unit: String,
  pub fingerprint: Option<Fingerprint>,
  pub params: ParameterSet,
  pub error_kind: String,
  pub message: String,
  pub workdir: PathBuf,
  pub occurred_at: DateTime<Utc>,
}

/// Crash records as JSON files, one per instance id.
#[derive(Debug, Clone)]
pub struct CrashStore {
  dir: PathBuf,
}

impl CrashStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn path_for(&self, instance_id: &str) -> PathBuf {
    self.dir.join(format!("{}.json", instance_id))
  }

  /// Persist a record atomically. A later crash of the same instance
  /// replaces it.
  pub async fn write(&self, record: CrashRecord) -> Result<PathBuf, CacheError> {
    let path = self.path_for(&record.instance_id);
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_json_atomic(&target, &record))
      .await
      .map_err(|e| CacheError::Io {
        path: path.clone(),
        source: std::io::Error::other(e),
      })??;
    Ok(path)
  }

  pub async fn read(path: &Path) -> Result<CrashRecord, CacheError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| CacheError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_write_and_read_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = CrashStore::new(dir.path().join("crashes"));
    let record = CrashRecord {
      run_id: "run".to_string(),
      node_id: "smooth".to_string(),
      instance_id: "smooth.2".to_string(),
      unit: "smooth".to_string(),
      fingerprint: None,
      params: [("fwhm".to_string(), json!(4))].into_iter().collect(),
      error_kind: "process_failed".to_string(),
      message: "exit 1".to_string(),
      workdir: dir.path().join("work/smooth/_2"),
      occurred_at: Utc::now(),
    };

    let path = store.write(record.clone()).await.unwrap();
    assert_eq!(path, dir.path().join("crashes").join("smooth.2.json"));
    assert_eq!(CrashStore::read(&path).await.unwrap(), record);
  }
}
