use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::task::TaskDef;

/// The planner's output for one run: tasks in declaration order.
///
/// Any sequencing between tasks has already been flattened by the planner;
/// the order here is the dispatch order and nothing more.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
  #[serde(default)]
  pub tasks: Vec<TaskDef>,

  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Dag {
  pub fn new(tasks: Vec<TaskDef>) -> Self {
    Self {
      tasks,
      extra: Map::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  /// Check that task ids are unique and every type is routable.
  pub fn validate(&self) -> Result<(), ConfigError> {
    validate_tasks(&self.tasks)
  }
}

pub(crate) fn validate_tasks(tasks: &[TaskDef]) -> Result<(), ConfigError> {
  let mut seen = HashSet::with_capacity(tasks.len());
  for task in tasks {
    if task.id.trim().is_empty() {
      return Err(ConfigError::MissingField {
        field: "id",
        context: format!("task of type '{}'", task.task_type),
      });
    }
    if !task.has_routable_type() {
      return Err(ConfigError::InvalidTaskType {
        task_id: task.id.clone(),
        task_type: task.task_type.clone(),
      });
    }
    if !seen.insert(task.id.as_str()) {
      return Err(ConfigError::DuplicateTask(task.id.clone()));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_planner_output() {
    let dag: Dag = serde_json::from_value(json!({
      "tasks": [
        {"id": "t1", "type": "build"},
        {"id": "t2", "type": "test", "suite": "unit"}
      ]
    }))
    .unwrap();

    assert_eq!(dag.len(), 2);
    assert_eq!(dag.tasks[0].id, "t1");
    assert_eq!(dag.tasks[1].fields["suite"], "unit");
    assert!(dag.validate().is_ok());
  }

  #[test]
  fn test_missing_tasks_is_empty() {
    let dag: Dag = serde_json::from_value(json!({})).unwrap();
    assert!(dag.is_empty());
  }

  #[test]
  fn test_duplicate_ids_rejected() {
    let dag = Dag::new(vec![TaskDef::new("t1", "build"), TaskDef::new("t1", "test")]);
    assert!(matches!(dag.validate(), Err(ConfigError::DuplicateTask(id)) if id == "t1"));
  }

  #[test]
  fn test_unroutable_type_rejected() {
    let dag = Dag::new(vec![TaskDef::new("t1", "task.build")]);
    assert!(matches!(
      dag.validate(),
      Err(ConfigError::InvalidTaskType { .. })
    ));
  }
}
