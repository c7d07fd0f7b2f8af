//! Cairn Cache
//!
//! This crate provides the result cache: a mapping from [`Fingerprint`] to
//! the outputs a unit produced for that fingerprint.
//!
//! The [`CacheStore`] trait defines:
//! - lookup, store, and invalidation of entries
//! - per-fingerprint claims, so one fingerprint is never computed twice at
//!   the same time
//! - access to the result marker kept in each working directory
//!
//! An entry only counts as a hit while the working directory it points at
//! still carries a marker for the same fingerprint. Corrupt or stale entries
//! are dropped and reported as misses.

mod atomic;
mod claim;
mod entry;
mod fs;

pub use atomic::write_json_atomic;
pub use claim::{ClaimGuard, ClaimTable};
pub use entry::CacheEntry;
pub use fs::FsCacheStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cairn_params::{Fingerprint, Identity};
use cairn_unit::OutputSet;

/// File name of the result marker written into a working directory.
pub const RESULT_MARKER: &str = "_cairn_result.json";

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("io error on {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Unreadable or failing its checksum. Stores log these and treat them as
  /// misses.
  #[error("corrupt cache entry {}: {reason}", .path.display())]
  Corrupt { path: PathBuf, reason: String },
}

/// Storage for completed results.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Find the entry for a fingerprint. Corrupt and stale entries are removed
  /// and reported as `None`.
  async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

  /// Record a successful result. Writes the entry and the working-directory
  /// marker atomically.
  async fn store(
    &self,
    fingerprint: &Fingerprint,
    identity: &Identity,
    outputs: &OutputSet,
    workdir: &Path,
  ) -> Result<CacheEntry, CacheError>;

  /// Remove an entry. Returns whether one existed.
  async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

  /// Wait for exclusive use of a fingerprint. Held until the guard drops.
  async fn claim(&self, fingerprint: &Fingerprint) -> ClaimGuard;

  /// Read the result marker in a working directory, if any.
  async fn read_marker(&self, workdir: &Path) -> Result<Option<CacheEntry>, CacheError>;

  /// All readable entries.
  async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError>;
}
