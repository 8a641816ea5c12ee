use chrono::{DateTime, Utc};
use conductor_config::{TaskDef, TaskUpdates, WorkflowSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Run-level parameter overrides supplied when a run is started.
pub type Overrides = Map<String, Value>;

/// Status of a run. Derived from its tasks, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Running,
  Success,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, RunStatus::Running)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RunStatus::Running => "running",
      RunStatus::Success => "success",
      RunStatus::Failed => "failed",
    }
  }
}

/// Status of a task within a run.
///
/// `timeout` is recorded when a task's deadline passes without a result and
/// counts as a failed outcome in the rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Running,
  Pass,
  Fail,
  Timeout,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, TaskStatus::Pending | TaskStatus::Running)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Pass => "pass",
      TaskStatus::Fail => "fail",
      TaskStatus::Timeout => "timeout",
    }
  }
}

/// A stored workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
  pub id: String,
  pub name: String,
  pub spec: WorkflowSpec,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Listing entry for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
  pub workflow_id: String,
  pub name: String,
  /// Declared schedule, empty when the workflow has none.
  pub schedule: String,
}

impl From<&WorkflowRecord> for WorkflowSummary {
  fn from(record: &WorkflowRecord) -> Self {
    Self {
      workflow_id: record.id.clone(),
      name: record.name.clone(),
      schedule: record.spec.schedule.clone().unwrap_or_default(),
    }
  }
}

/// One execution of a workflow, owning its own spec snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
  pub id: String,
  pub workflow_id: String,
  pub spec: WorkflowSpec,
  pub overrides: Overrides,
  pub status: RunStatus,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  /// Set when the run was closed by force: cancelled, or its plan could not
  /// be requested or was invalid. Such a run takes no further results or
  /// patches.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cancelled_at: Option<DateTime<Utc>>,
  /// Highest inbound message sequence accepted for this run.
  pub last_sequence: Option<u64>,
}

/// A task record within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
  pub run_id: String,
  pub task_id: String,
  pub task_type: String,
  pub payload: TaskDef,
  pub status: TaskStatus,
  /// 1 for the first dispatch, incremented by every applied patch.
  pub attempt: u32,
  pub output: Option<Value>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
  pub(crate) fn new(run_id: &str, task: &TaskDef, attempt: u32, now: DateTime<Utc>) -> Self {
    Self {
      run_id: run_id.to_string(),
      task_id: task.id.clone(),
      task_type: task.task_type.clone(),
      payload: task.clone(),
      status: TaskStatus::Pending,
      attempt,
      output: None,
      started_at: now,
      completed_at: None,
    }
  }
}

/// Append-only audit record of a correction applied to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
  pub id: String,
  pub run_id: String,
  pub task_id: String,
  pub timestamp: DateTime<Utc>,
  pub updates: TaskUpdates,
}

/// Task entry of a run status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
  pub task_id: String,
  #[serde(rename = "type")]
  pub task_type: String,
  pub status: TaskStatus,
  pub attempt: u32,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for TaskSummary {
  fn from(task: &TaskRecord) -> Self {
    Self {
      task_id: task.task_id.clone(),
      task_type: task.task_type.clone(),
      status: task.status,
      attempt: task.attempt,
      started_at: task.started_at,
      completed_at: task.completed_at,
    }
  }
}

/// Point-in-time view of a run and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
  pub run_id: String,
  pub workflow_id: String,
  pub status: RunStatus,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub tasks: Vec<TaskSummary>,
}

impl RunStatusView {
  pub(crate) fn new(run: &RunRecord, tasks: &[TaskRecord]) -> Self {
    Self {
      run_id: run.id.clone(),
      workflow_id: run.workflow_id.clone(),
      status: run.status,
      started_at: run.started_at,
      completed_at: run.completed_at,
      tasks: tasks.iter().map(TaskSummary::from).collect(),
    }
  }
}

/// Result of recomputing a run's status after a task changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupOutcome {
  pub previous: RunStatus,
  pub status: RunStatus,
  pub completed_at: Option<DateTime<Utc>>,
}

impl RollupOutcome {
  /// The run went from `running` to a terminal status with this update.
  pub fn finished(&self) -> bool {
    !self.previous.is_terminal() && self.status.is_terminal()
  }
}
