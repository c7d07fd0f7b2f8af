use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cairn_unit::{FieldType, ParameterSet, UnitSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::ParamError;

/// Bumped whenever the identity document layout changes, so old cache
/// entries stop matching instead of matching wrongly.
pub const FINGERPRINT_VERSION: &str = "cairn-fingerprint-v1";

const PATH_KEY: &str = "$path";
const DIGEST_KEY: &str = "$sha256";

/// Lowercase hex SHA-256 content address of an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// First 12 hex digits, for logs.
  pub fn short(&self) -> &str {
    &self.0[..12]
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for Fingerprint {
  type Err = ParamError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
      Ok(Fingerprint(s.to_string()))
    } else {
      Err(ParamError::InvalidFingerprint {
        value: s.to_string(),
      })
    }
  }
}

impl TryFrom<String> for Fingerprint {
  type Error = ParamError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Fingerprint> for String {
  fn from(fingerprint: Fingerprint) -> Self {
    fingerprint.0
  }
}

/// The canonical document a fingerprint is computed from.
///
/// `inputs` holds only identity-affecting fields. File and directory values
/// are replaced by `{"$path": .., "$sha256": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
  pub unit: String,
  pub inputs: BTreeMap<String, Value>,
  #[serde(default)]
  pub combination: Vec<usize>,
}

impl Identity {
  pub fn fingerprint(&self) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(&self.document()).as_bytes());
    Fingerprint(format!("{:x}", hasher.finalize()))
  }

  /// The identity with every recorded location removed. Equal for two
  /// identities whose referenced content is identical but lives elsewhere.
  pub fn relocatable(&self) -> Identity {
    Identity {
      unit: self.unit.clone(),
      inputs: self
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), strip_paths(v)))
        .collect(),
      combination: self.combination.clone(),
    }
  }

  fn document(&self) -> Value {
    let mut doc = Map::new();
    doc.insert("unit".to_string(), Value::String(self.unit.clone()));
    doc.insert(
      "inputs".to_string(),
      Value::Object(self.inputs.clone().into_iter().collect()),
    );
    doc.insert(
      "combination".to_string(),
      Value::Array(self.combination.iter().map(|i| Value::from(*i)).collect()),
    );
    Value::Object(doc)
  }
}

/// Build the identity of a resolved parameter set.
pub fn identity(spec: &UnitSpec, params: &ParameterSet, combination: &[usize]) -> Result<Identity, ParamError> {
  let mut inputs = BTreeMap::new();
  for field in spec.inputs.iter().filter(|f| f.affects_identity) {
    if let Some(value) = params.get(&field.name) {
      inputs.insert(
        field.name.clone(),
        contribution(&field.name, &field.field_type, value)?,
      );
    }
  }
  Ok(Identity {
    unit: spec.name.clone(),
    inputs,
    combination: combination.to_vec(),
  })
}

pub fn fingerprint(spec: &UnitSpec, params: &ParameterSet) -> Result<Fingerprint, ParamError> {
  fingerprint_at(spec, params, &[])
}

/// Fingerprint of one fan-out combination.
pub fn fingerprint_at(
  spec: &UnitSpec,
  params: &ParameterSet,
  combination: &[usize],
) -> Result<Fingerprint, ParamError> {
  Ok(identity(spec, params, combination)?.fingerprint())
}

fn contribution(field: &str, field_type: &FieldType, value: &Value) -> Result<Value, ParamError> {
  match (field_type, value) {
    (FieldType::File, Value::String(path)) => {
      let path = PathBuf::from(path);
      if !path.is_file() {
        return Err(ParamError::MissingFile {
          field: field.to_string(),
          path,
        });
      }
      let digest = digest_file(&path).map_err(|source| ParamError::Io {
        path: path.clone(),
        source,
      })?;
      trace!(field, path = %path.display(), digest = %digest, "file_hashed");
      Ok(path_contribution(&path, digest))
    }
    (FieldType::Directory, Value::String(path)) => {
      let path = PathBuf::from(path);
      if !path.is_dir() {
        return Err(ParamError::MissingFile {
          field: field.to_string(),
          path,
        });
      }
      let digest = digest_directory(&path)?;
      Ok(path_contribution(&path, digest))
    }
    (FieldType::List(inner), Value::Array(items)) => items
      .iter()
      .map(|item| contribution(field, inner, item))
      .collect::<Result<Vec<_>, _>>()
      .map(Value::Array),
    (FieldType::Number, Value::Number(n)) => Ok(normalize_number(n)),
    _ => Ok(sort_keys(value)),
  }
}

fn path_contribution(path: &Path, digest: String) -> Value {
  let mut map = Map::new();
  map.insert(
    PATH_KEY.to_string(),
    Value::String(path.to_string_lossy().into_owned()),
  );
  map.insert(DIGEST_KEY.to_string(), Value::String(digest));
  Value::Object(map)
}

/// `4.0` and `4` are the same number to a tool.
fn normalize_number(n: &serde_json::Number) -> Value {
  match n.as_f64() {
    Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
      Value::from(f as i64)
    }
    _ => Value::Number(n.clone()),
  }
}

fn digest_file(path: &Path) -> io::Result<String> {
  let mut file = fs::File::open(path)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher)?;
  Ok(format!("{:x}", hasher.finalize()))
}

/// Digest over the sorted relative paths and content digests of every file
/// below `root`.
fn digest_directory(root: &Path) -> Result<String, ParamError> {
  let mut files = Vec::new();
  collect_files(root, root, &mut files)?;
  files.sort();

  let mut hasher = Sha256::new();
  for (relative, path) in files {
    let digest = digest_file(&path).map_err(|source| ParamError::Io {
      path: path.clone(),
      source,
    })?;
    hasher.update(relative.as_bytes());
    hasher.update(b"\0");
    hasher.update(digest.as_bytes());
    hasher.update(b"\n");
  }
  Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), ParamError> {
  let io_err = |path: &Path| {
    let path = path.to_path_buf();
    move |source: io::Error| ParamError::Io { path, source }
  };

  for entry in fs::read_dir(dir).map_err(io_err(dir))? {
    let entry = entry.map_err(io_err(dir))?;
    let path = entry.path();
    if path.is_dir() {
      collect_files(root, &path, out)?;
    } else if path.is_file() {
      let relative = path
        .strip_prefix(root)
        .unwrap_or(path.as_path())
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
      out.push((relative, path));
    }
  }
  Ok(())
}

fn strip_paths(value: &Value) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .iter()
        .filter(|(k, _)| k.as_str() != PATH_KEY)
        .map(|(k, v)| (k.clone(), strip_paths(v)))
        .collect(),
    ),
    Value::Array(items) => Value::Array(items.iter().map(strip_paths).collect()),
    other => other.clone(),
  }
}

/// Rebuild objects with keys in sorted order, recursively.
fn sort_keys(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<_> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| (k.clone(), sort_keys(v)))
          .collect(),
      )
    }
    Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
    other => other.clone(),
  }
}

fn canonical_json(value: &Value) -> String {
  sort_keys(value).to_string()
}
