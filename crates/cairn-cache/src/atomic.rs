use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::CacheError;

/// Write `value` as pretty JSON to `path` so readers see either the old file
/// or the complete new one.
///
/// Writes a sibling temp file, syncs it, renames it over `path`, then syncs
/// the parent directory.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
  let content = serde_json::to_vec_pretty(value)?;
  atomic_write_file(path, &content).map_err(|source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  })
}

fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
  let parent = path
    .parent()
    .ok_or_else(|| std::io::Error::other("path has no parent"))?;
  fs::create_dir_all(parent)?;

  let tmp_path = parent.join(format!(
    ".{}.tmp-{}-{}",
    path.file_name().and_then(|v| v.to_str()).unwrap_or("entry"),
    std::process::id(),
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or(0),
  ));

  let written = (|| {
    let mut file = fs::OpenOptions::new()
      .create_new(true)
      .write(true)
      .open(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)
  })();
  if written.is_err() {
    let _ = fs::remove_file(&tmp_path);
  }
  written?;

  sync_parent_dir(parent)
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
  fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
  Ok(())
}
