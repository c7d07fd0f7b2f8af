use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cairn_params::{Fingerprint, Identity};
use cairn_unit::OutputSet;
use tracing::{debug, warn};

use crate::{CacheEntry, CacheError, CacheStore, ClaimGuard, ClaimTable, RESULT_MARKER, write_json_atomic};

/// Filesystem cache: one JSON file per entry at `<root>/<fp[0..2]>/<fp>.json`.
#[derive(Debug)]
pub struct FsCacheStore {
  root: PathBuf,
  claims: ClaimTable,
}

impl FsCacheStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      claims: ClaimTable::new(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    let fp = fingerprint.as_str();
    self.root.join(&fp[..2]).join(format!("{}.json", fp))
  }

  async fn read(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match tokio::fs::read(path).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(source) => Err(CacheError::Io {
        path: path.to_path_buf(),
        source,
      }),
    }
  }

  async fn remove(path: &Path) -> Result<bool, CacheError> {
    match tokio::fs::remove_file(path).await {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
      Err(source) => Err(CacheError::Io {
        path: path.to_path_buf(),
        source,
      }),
    }
  }

  async fn write(path: PathBuf, entry: CacheEntry) -> Result<(), CacheError> {
    tokio::task::spawn_blocking(move || write_json_atomic(&path, &entry))
      .await
      .map_err(|e| CacheError::Io {
        path: PathBuf::new(),
        source: std::io::Error::other(e),
      })?
  }
}

#[async_trait]
impl CacheStore for FsCacheStore {
  async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let path = self.entry_path(fingerprint);
    let Some(bytes) = Self::read(&path).await? else {
      return Ok(None);
    };

    let entry = match CacheEntry::decode(&path, &bytes) {
      Ok(entry) if &entry.fingerprint == fingerprint => entry,
      Ok(_) => {
        warn!(fingerprint = %fingerprint, path = %path.display(), "cache_entry_misfiled");
        Self::remove(&path).await?;
        return Ok(None);
      }
      Err(e) => {
        warn!(fingerprint = %fingerprint, error = %e, "cache_entry_corrupt");
        Self::remove(&path).await?;
        return Ok(None);
      }
    };

    let marker = self.read_marker(&entry.workdir).await?;
    if marker.as_ref().map(|m| &m.fingerprint) != Some(fingerprint) {
      debug!(
        fingerprint = %fingerprint,
        workdir = %entry.workdir.display(),
        "cache_entry_stale"
      );
      Self::remove(&path).await?;
      return Ok(None);
    }

    Ok(Some(entry))
  }

  async fn store(
    &self,
    fingerprint: &Fingerprint,
    identity: &Identity,
    outputs: &OutputSet,
    workdir: &Path,
  ) -> Result<CacheEntry, CacheError> {
    let entry = CacheEntry::new(
      fingerprint.clone(),
      identity.clone(),
      outputs.clone(),
      workdir.to_path_buf(),
    );
    // Marker first: an entry without its marker is stale anyway.
    Self::write(workdir.join(RESULT_MARKER), entry.clone()).await?;
    Self::write(self.entry_path(fingerprint), entry.clone()).await?;
    debug!(fingerprint = %fingerprint, workdir = %workdir.display(), "cache_entry_stored");
    Ok(entry)
  }

  async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    Self::remove(&self.entry_path(fingerprint)).await
  }

  async fn claim(&self, fingerprint: &Fingerprint) -> ClaimGuard {
    self.claims.claim(fingerprint).await
  }

  async fn read_marker(&self, workdir: &Path) -> Result<Option<CacheEntry>, CacheError> {
    let path = workdir.join(RESULT_MARKER);
    let Some(bytes) = Self::read(&path).await? else {
      return Ok(None);
    };
    match CacheEntry::decode(&path, &bytes) {
      Ok(entry) => Ok(Some(entry)),
      Err(e) => {
        warn!(error = %e, "result_marker_corrupt");
        Ok(None)
      }
    }
  }

  async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
    let mut entries = Vec::new();
    let mut shards = match tokio::fs::read_dir(&self.root).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
      Err(source) => {
        return Err(CacheError::Io {
          path: self.root.clone(),
          source,
        });
      }
    };

    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source: std::io::Error| CacheError::Io { path, source }
    };

    while let Some(shard) = shards.next_entry().await.map_err(io_err(self.root.as_path()))? {
      if !shard.file_type().await.map_err(io_err(shard.path().as_path()))?.is_dir() {
        continue;
      }
      let mut files = tokio::fs::read_dir(shard.path())
        .await
        .map_err(io_err(shard.path().as_path()))?;
      while let Some(file) = files.next_entry().await.map_err(io_err(shard.path().as_path()))? {
        let path = file.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
          continue;
        }
        let Some(bytes) = Self::read(&path).await? else {
          continue;
        };
        match CacheEntry::decode(&path, &bytes) {
          Ok(entry) => entries.push(entry),
          Err(e) => warn!(error = %e, "cache_entry_corrupt"),
        }
      }
    }

    entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(entries)
  }
}
