//! Generic command-line unit.
//!
//! Runs an external program inside the instance working directory. Arguments
//! are templates rendered against the resolved inputs (plus `workdir`);
//! arguments that render to an empty string are dropped, which is how
//! optional flags are expressed.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::coerce::{coerce_value, render_template};
use crate::error::UnitError;
use crate::types::{FieldType, OutputSet, ParameterSet, UnitSpec};
use crate::unit::{RunContext, UnitOfWork};

/// Max bytes of stderr kept in a `ProcessFailed` error.
const STDERR_TAIL_BYTES: usize = 4096;

/// Where a command output field takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum OutputSource {
  /// Captured stdout, coerced to the field type.
  Stdout,
  /// A path template relative to the working directory. `file` and
  /// `directory` fields yield the absolute path; other types read the file
  /// and coerce its content.
  Path { path: String },
}

/// A unit that launches an external program.
#[derive(Debug, Clone)]
pub struct CommandUnit {
  spec: UnitSpec,
  program: String,
  args: Vec<String>,
  outputs: BTreeMap<String, OutputSource>,
  timeout: Option<Duration>,
}

impl CommandUnit {
  pub fn new(spec: UnitSpec, program: impl Into<String>) -> Self {
    Self {
      spec,
      program: program.into(),
      args: Vec::new(),
      outputs: BTreeMap::new(),
      timeout: None,
    }
  }

  pub fn arg(mut self, template: impl Into<String>) -> Self {
    self.args.push(template.into());
    self
  }

  pub fn args<I, S>(mut self, templates: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(templates.into_iter().map(Into::into));
    self
  }

  /// Declare where an output field comes from. Fields without a source are
  /// read from stdout.
  pub fn output_from(mut self, field: impl Into<String>, source: OutputSource) -> Self {
    self.outputs.insert(field.into(), source);
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn program(&self) -> &str {
    &self.program
  }

  /// Render the argument list for the given inputs.
  pub fn render_args(&self, inputs: &ParameterSet, workdir: &Path) -> Result<Vec<String>, UnitError> {
    let env = Environment::new();
    let context = template_context(inputs, workdir);
    let mut rendered = Vec::with_capacity(self.args.len());
    for template in &self.args {
      let arg = render_template(&env, template, &context).map_err(|e| UnitError::Launch {
        program: self.program.clone(),
        message: format!("failed to render argument '{}': {}", template, e),
      })?;
      if !arg.is_empty() {
        rendered.push(arg);
      }
    }
    Ok(rendered)
  }

  async fn collect_outputs(
    &self,
    inputs: &ParameterSet,
    stdout: &str,
    workdir: &Path,
  ) -> Result<OutputSet, UnitError> {
    let env = Environment::new();
    let context = template_context(inputs, workdir);
    let mut outputs = OutputSet::new();

    for field in &self.spec.outputs {
      let source = self.outputs.get(&field.name).unwrap_or(&OutputSource::Stdout);
      let value = match source {
        OutputSource::Stdout => coerce_value(&field.name, stdout, &field.field_type, workdir)?,
        OutputSource::Path { path } => {
          let rendered =
            render_template(&env, path, &context).map_err(|e| UnitError::InvalidOutput {
              field: field.name.clone(),
              message: format!("failed to render path '{}': {}", path, e),
            })?;
          let full = workdir.join(rendered.trim());
          match field.field_type {
            FieldType::File | FieldType::Directory => {
              let exists = match field.field_type {
                FieldType::File => full.is_file(),
                _ => full.is_dir(),
              };
              if !exists {
                return Err(UnitError::InvalidOutput {
                  field: field.name.clone(),
                  message: format!("expected {} at {}", field.field_type, full.display()),
                });
              }
              serde_json::Value::String(full.to_string_lossy().into_owned())
            }
            _ => {
              let content =
                tokio::fs::read_to_string(&full)
                  .await
                  .map_err(|e| UnitError::InvalidOutput {
                    field: field.name.clone(),
                    message: format!("failed to read {}: {}", full.display(), e),
                  })?;
              coerce_value(&field.name, &content, &field.field_type, workdir)?
            }
          }
        }
      };
      outputs.insert(field.name.clone(), value);
    }

    Ok(outputs)
  }
}

#[async_trait]
impl UnitOfWork for CommandUnit {
  fn spec(&self) -> &UnitSpec {
    &self.spec
  }

  #[instrument(
    name = "command_run",
    skip(self, inputs, ctx),
    fields(unit = %self.spec.name, instance_id = %ctx.instance_id)
  )]
  async fn run(&self, inputs: &ParameterSet, ctx: &RunContext) -> Result<OutputSet, UnitError> {
    if ctx.cancel.is_cancelled() {
      return Err(UnitError::Cancelled);
    }

    let args = self.render_args(inputs, &ctx.workdir)?;
    let command_line = std::iter::once(self.program.as_str())
      .chain(args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ");
    write_record(&ctx.workdir.join("command.txt"), &command_line).await;

    info!(command = %command_line, "command_started");

    let child = Command::new(&self.program)
      .args(&args)
      .current_dir(&ctx.workdir)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| UnitError::Launch {
        program: self.program.clone(),
        message: e.to_string(),
      })?;

    let timeout = self.timeout;
    let wait = async move {
      let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
          .await
          .map_err(|_| UnitError::Timeout {
            timeout_ms: limit.as_millis() as u64,
          })?,
        None => child.wait_with_output().await,
      };
      result.map_err(|e| UnitError::failed(format!("failed to wait for process: {}", e)))
    };

    // Dropping `wait` drops the child, and kill_on_drop terminates it.
    let output = tokio::select! {
      result = wait => result?,
      _ = ctx.cancel.cancelled() => {
        warn!("command cancelled, terminating process");
        return Err(UnitError::Cancelled);
      }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    write_record(&ctx.workdir.join("stdout.txt"), &stdout).await;
    write_record(&ctx.workdir.join("stderr.txt"), &stderr).await;

    if !output.status.success() {
      return Err(UnitError::ProcessFailed {
        code: output.status.code(),
        stderr: tail(&stderr, STDERR_TAIL_BYTES).trim().to_string(),
      });
    }

    debug!(status = ?output.status.code(), "command_exited");
    self.collect_outputs(inputs, &stdout, &ctx.workdir).await
  }
}

fn template_context(inputs: &ParameterSet, workdir: &Path) -> serde_json::Value {
  let mut map: serde_json::Map<String, serde_json::Value> = inputs
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  map.insert(
    "workdir".to_string(),
    serde_json::Value::String(workdir.to_string_lossy().into_owned()),
  );
  serde_json::Value::Object(map)
}

fn tail(s: &str, max: usize) -> &str {
  if s.len() <= max {
    return s;
  }
  let mut start = s.len() - max;
  while !s.is_char_boundary(start) {
    start += 1;
  }
  &s[start..]
}

/// Records are for inspection only; failing to write one does not fail the run.
async fn write_record(path: &Path, contents: &str) {
  if let Err(e) = tokio::fs::write(path, contents).await {
    warn!(path = %path.display(), error = %e, "record_write_failed");
  }
}
