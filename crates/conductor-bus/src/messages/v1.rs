//! Version 1 payloads, one type per subject.
//!
//! Field names are camelCase on the wire to stay compatible with the
//! existing planner, executors and auto-fix generator.

use chrono::{DateTime, SecondsFormat, Utc};
use conductor_config::{Dag, TaskDef, TaskUpdates};
use conductor_store::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `workflow.plan.request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
  pub text: String,
  pub workflow_id: String,
  pub run_id: String,
  pub reply_to: String,
}

/// `workflow.plan.response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workflow_id: Option<String>,
  pub run_id: String,
  pub dag: Dag,
  /// Idempotency key, increasing per run.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seq: Option<u64>,
}

/// `task.<type>.request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
  pub run_id: String,
  pub task_id: String,
  pub payload: TaskDef,
}

/// Status an executor may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
  Running,
  Pass,
  Fail,
}

impl From<ReportedStatus> for TaskStatus {
  fn from(status: ReportedStatus) -> Self {
    match status {
      ReportedStatus::Running => TaskStatus::Running,
      ReportedStatus::Pass => TaskStatus::Pass,
      ReportedStatus::Fail => TaskStatus::Fail,
    }
  }
}

/// `task.<type>.response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
  pub run_id: String,
  pub task_id: String,
  pub status: ReportedStatus,
  #[serde(default = "empty_object")]
  pub output: Value,
}

fn empty_object() -> Value {
  Value::Object(Map::new())
}

/// `workflow.autofix.request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutofixRequest {
  pub run_id: String,
  pub task_id: String,
  pub output: Value,
}

/// The correction carried by an auto-fix response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEnvelope {
  pub task_id: String,
  #[serde(default)]
  pub patch: TaskUpdates,
}

/// `workflow.autofix.response`
///
/// Accepted as `{runId, patch: {taskId, patch}}` or as the flat
/// `{runId?, taskId, patch}` the generator emits. Always serialized nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "AutofixWire")]
pub struct AutofixResponse {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_id: Option<String>,
  pub patch: PatchEnvelope,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub seq: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AutofixWire {
  #[serde(rename_all = "camelCase")]
  Nested {
    #[serde(default)]
    run_id: Option<String>,
    patch: PatchEnvelope,
    #[serde(default)]
    seq: Option<u64>,
  },
  #[serde(rename_all = "camelCase")]
  Flat {
    #[serde(default)]
    run_id: Option<String>,
    task_id: String,
    #[serde(default)]
    patch: TaskUpdates,
    #[serde(default)]
    seq: Option<u64>,
  },
}

impl From<AutofixWire> for AutofixResponse {
  fn from(wire: AutofixWire) -> Self {
    match wire {
      AutofixWire::Nested { run_id, patch, seq } => Self { run_id, patch, seq },
      AutofixWire::Flat {
        run_id,
        task_id,
        patch,
        seq,
      } => Self {
        run_id,
        patch: PatchEnvelope { task_id, patch },
        seq,
      },
    }
  }
}

/// Severity of a `workflow.logs.stream` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
  Info,
  Warn,
  Error,
}

/// `workflow.logs.stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
  pub timestamp: String,
  pub level: LogLevel,
  pub message: String,
}

impl LogEntry {
  pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
    Self::at(Utc::now(), level, message)
  }

  pub fn at(timestamp: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
    Self {
      timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
      level,
      message: message.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_plan_request_wire_shape() {
    let request = PlanRequest {
      text: "Run workflow wf1".to_string(),
      workflow_id: "wf1".to_string(),
      run_id: "r1".to_string(),
      reply_to: "workflow.plan.response".to_string(),
    };
    assert_eq!(
      serde_json::to_value(&request).unwrap(),
      json!({
        "text": "Run workflow wf1",
        "workflowId": "wf1",
        "runId": "r1",
        "replyTo": "workflow.plan.response"
      })
    );
  }

  #[test]
  fn test_plan_response_keeps_task_fields() {
    let response: PlanResponse = serde_json::from_value(json!({
      "workflowId": "wf1",
      "runId": "r1",
      "dag": {"tasks": [{"id": "t1", "type": "build", "image": "svc"}]}
    }))
    .unwrap();

    assert_eq!(response.dag.tasks[0].fields["image"], "svc");
    assert_eq!(response.seq, None);
  }

  #[test]
  fn test_task_response_defaults_output() {
    let response: TaskResponse =
      serde_json::from_value(json!({"runId": "r1", "taskId": "t1", "status": "pass"})).unwrap();
    assert_eq!(response.output, json!({}));
    assert_eq!(TaskStatus::from(response.status), TaskStatus::Pass);

    let bad = serde_json::from_value::<TaskResponse>(
      json!({"runId": "r1", "taskId": "t1", "status": "done"}),
    );
    assert!(bad.is_err());
  }

  #[test]
  fn test_autofix_response_accepts_both_shapes() {
    let nested: AutofixResponse = serde_json::from_value(json!({
      "runId": "r1",
      "patch": {"taskId": "t2", "patch": {"command": "make"}}
    }))
    .unwrap();
    let flat: AutofixResponse =
      serde_json::from_value(json!({"taskId": "t2", "patch": {"command": "make"}})).unwrap();

    assert_eq!(nested.run_id.as_deref(), Some("r1"));
    assert_eq!(flat.run_id, None);
    assert_eq!(nested.patch, flat.patch);
    assert_eq!(flat.patch.patch["command"], "make");

    // Serialized form is always nested.
    assert_eq!(
      serde_json::to_value(&nested).unwrap(),
      json!({"runId": "r1", "patch": {"taskId": "t2", "patch": {"command": "make"}}})
    );
  }

  #[test]
  fn test_log_entry_levels_are_uppercase() {
    let entry = LogEntry::new(LogLevel::Warn, "task t1 timed out");
    let value = serde_json::to_value(&entry).unwrap();
    assert_eq!(value["level"], "WARN");
    assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
  }
}
