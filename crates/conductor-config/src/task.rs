use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Field-level overrides carried by a patch.
pub type TaskUpdates = Map<String, Value>;

/// A single task entry of a workflow spec or a planned DAG.
///
/// Only `id` and `type` are interpreted. Everything else is kept in `fields`
/// and forwarded to the executor verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
  pub id: String,

  /// Routing key: requests for this task go to `task.<type>.request`.
  #[serde(rename = "type")]
  pub task_type: String,

  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl TaskDef {
  pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      task_type: task_type.into(),
      fields: Map::new(),
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
    self.fields.insert(key.into(), value);
    self
  }

  /// Deadline declared on the task itself, in milliseconds.
  pub fn timeout_ms(&self) -> Option<u64> {
    self.fields.get("timeoutMs").and_then(Value::as_u64)
  }

  /// Overwrite top-level fields with `updates`.
  ///
  /// `id` is never overwritten. A string `type` re-routes the task; any other
  /// `type` value is ignored.
  pub fn apply(&mut self, updates: &TaskUpdates) {
    for (key, value) in updates {
      match key.as_str() {
        "id" => {}
        "type" => {
          if let Some(task_type) = value.as_str() {
            self.task_type = task_type.to_string();
          }
        }
        _ => {
          self.fields.insert(key.clone(), value.clone());
        }
      }
    }
  }

  /// Whether `type` is usable as a single subject token.
  pub fn has_routable_type(&self) -> bool {
    !self.task_type.is_empty()
      && !self
        .task_type
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
  }

  /// The task with `updates` applied, provided it can still be routed.
  pub fn patched(&self, updates: &TaskUpdates) -> Result<TaskDef, ConfigError> {
    let mut task = self.clone();
    task.apply(updates);
    if !task.has_routable_type() {
      return Err(ConfigError::InvalidTaskType {
        task_id: task.id,
        task_type: task.task_type,
      });
    }
    Ok(task)
  }
}
