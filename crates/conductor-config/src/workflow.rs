use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dag::validate_tasks;
use crate::error::ConfigError;
use crate::task::{TaskDef, TaskUpdates};

/// A workflow document as uploaded by a user.
///
/// The workflow id is its `name`. Keys conductor does not interpret are kept
/// in `extra` and round-trip through storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
  #[serde(default)]
  pub name: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,

  /// Document version as written by the author (string or number).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<Value>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub schedule: Option<String>,

  #[serde(default)]
  pub tasks: Vec<TaskDef>,

  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl WorkflowSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      description: None,
      version: None,
      schedule: None,
      tasks: Vec::new(),
      extra: Map::new(),
    }
  }

  /// Parse a YAML (or JSON) document and validate it.
  pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
    let spec: WorkflowSpec = serde_yaml::from_str(content)?;
    spec.validate()?;
    Ok(spec)
  }

  pub fn from_value(value: Value) -> Result<Self, ConfigError> {
    let spec: WorkflowSpec = serde_json::from_value(value)?;
    spec.validate()?;
    Ok(spec)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.name.trim().is_empty() {
      return Err(ConfigError::MissingField {
        field: "name",
        context: "workflow spec".to_string(),
      });
    }
    validate_tasks(&self.tasks)
  }

  pub fn workflow_id(&self) -> &str {
    &self.name
  }

  /// Non-blank description, if any.
  pub fn description(&self) -> Option<&str> {
    self
      .description
      .as_deref()
      .filter(|d| !d.trim().is_empty())
  }

  pub fn task(&self, task_id: &str) -> Option<&TaskDef> {
    self.tasks.iter().find(|t| t.id == task_id)
  }

  /// Apply `updates` to the task with `task_id`.
  ///
  /// Returns `false` (and leaves the workflow untouched) when no such task exists.
  pub fn apply_patch(&mut self, task_id: &str, updates: &TaskUpdates) -> bool {
    match self.tasks.iter_mut().find(|t| t.id == task_id) {
      Some(task) => {
        task.apply(updates);
        true
      }
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const PIPELINE: &str = r#"
name: release-pipeline
description: Build, test and scan the service
version: 2
schedule: "0 3 * * *"
owner: platform-team
tasks:
  - id: build
    type: docker-build
    image: svc:latest
  - id: scan
    type: security
"#;

  #[test]
  fn test_from_yaml() {
    let spec = WorkflowSpec::from_yaml(PIPELINE).unwrap();

    assert_eq!(spec.workflow_id(), "release-pipeline");
    assert_eq!(spec.description(), Some("Build, test and scan the service"));
    assert_eq!(spec.version, Some(json!(2)));
    assert_eq!(spec.schedule.as_deref(), Some("0 3 * * *"));
    assert_eq!(spec.extra["owner"], "platform-team");
    assert_eq!(spec.tasks.len(), 2);
    assert_eq!(spec.task("build").unwrap().fields["image"], "svc:latest");
  }

  #[test]
  fn test_json_is_accepted() {
    let spec = WorkflowSpec::from_yaml(r#"{"name": "wf1", "tasks": []}"#).unwrap();
    assert_eq!(spec.name, "wf1");
  }

  #[test]
  fn test_missing_name_rejected() {
    let err = WorkflowSpec::from_yaml("description: nameless\n").unwrap_err();
    assert!(matches!(err, ConfigError::MissingField { field: "name", .. }));
  }

  #[test]
  fn test_blank_description_is_none() {
    let mut spec = WorkflowSpec::new("wf1");
    spec.description = Some("  ".to_string());
    assert_eq!(spec.description(), None);
  }

  #[test]
  fn test_apply_patch_unknown_task_is_noop() {
    let mut spec = WorkflowSpec::from_yaml(PIPELINE).unwrap();
    let before = spec.clone();
    let updates = json!({"image": "svc:fixed"}).as_object().cloned().unwrap();

    assert!(!spec.apply_patch("missing", &updates));
    assert_eq!(spec, before);

    assert!(spec.apply_patch("build", &updates));
    assert_eq!(spec.task("build").unwrap().fields["image"], "svc:fixed");
  }
}
