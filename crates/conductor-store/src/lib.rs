//! Conductor Store
//!
//! The provenance store: a queryable record of workflows, runs, tasks and
//! patches, and the authority for run status rollup.
//!
//! The [`ProvenanceStore`] trait defines every operation the bus and the
//! orchestrator need. Two implementations are provided:
//! - [`MemoryStore`] keeps everything in process, for tests and the
//!   `memory` database setting
//! - [`SqliteStore`] persists to SQLite through sqlx with embedded migrations
//!
//! Every read-modify-write on a run (result recording, patching,
//! cancellation) is serialized per run id, so concurrently arriving task
//! results always roll up against the latest sibling set.

mod error;
mod locks;
mod memory;
mod rollup;
mod sqlite;
mod state;
mod types;

pub use error::StoreError;
pub use locks::RunLocks;
pub use memory::MemoryStore;
pub use rollup::rollup;
pub use sqlite::SqliteStore;
pub use types::{
  Overrides, PatchRecord, RollupOutcome, RunRecord, RunStatus, RunStatusView, TaskRecord,
  TaskStatus, TaskSummary, WorkflowRecord, WorkflowSummary,
};

use async_trait::async_trait;
use conductor_config::{Dag, TaskDef, TaskUpdates, WorkflowSpec};
use serde_json::Value;

/// Storage trait for workflows, runs, tasks and patches.
///
/// Once a run is cancelled, task creation, results, running reports and
/// patches for it fail with [`StoreError::RunCancelled`].
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
  /// Create or replace the workflow keyed by its name.
  async fn create_workflow_node(&self, spec: &WorkflowSpec) -> Result<WorkflowRecord, StoreError>;

  async fn get_workflow_spec(&self, workflow_id: &str) -> Result<WorkflowSpec, StoreError>;

  async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StoreError>;

  /// Create a `running` run holding its own snapshot of `spec`.
  async fn create_run_node(
    &self,
    run_id: &str,
    workflow_id: &str,
    spec: &WorkflowSpec,
    overrides: &Overrides,
  ) -> Result<RunRecord, StoreError>;

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError>;

  /// Runs of a workflow, newest first.
  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>, StoreError>;

  /// Replace the run's snapshot task list with the planned DAG.
  async fn record_dag(&self, run_id: &str, dag: &Dag) -> Result<(), StoreError>;

  /// Create a `pending` task, or reset an existing one with the same id for
  /// another attempt.
  async fn create_task_node(&self, run_id: &str, task: &TaskDef) -> Result<TaskRecord, StoreError>;

  /// Move a pending task to `running`. Tasks in any other state are left as is.
  async fn mark_task_running(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError>;

  /// Record a task outcome and recompute the run status atomically.
  async fn record_task_result(
    &self,
    run_id: &str,
    task_id: &str,
    status: TaskStatus,
    output: Value,
  ) -> Result<RollupOutcome, StoreError>;

  /// Mark a task `timeout` if `attempt` is still its current, unfinished
  /// attempt. Returns `None` when the task already moved on.
  async fn expire_task(
    &self,
    run_id: &str,
    task_id: &str,
    attempt: u32,
    output: Value,
  ) -> Result<Option<RollupOutcome>, StoreError>;

  /// Append a patch to the audit trail. Returns `None` when the task is not
  /// part of the run.
  async fn record_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Option<PatchRecord>, StoreError>;

  /// Apply `updates` to the run's snapshot and reset the task (and the run)
  /// for a retry. Returns the run's task list, untouched for unknown tasks.
  async fn apply_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Vec<TaskDef>, StoreError>;

  async fn last_patch(&self, run_id: &str, task_id: &str) -> Result<Option<PatchRecord>, StoreError>;

  /// Every patch of a run in application order.
  async fn list_patches(&self, run_id: &str) -> Result<Vec<PatchRecord>, StoreError>;

  /// Fail every unfinished task with `output` and settle the run.
  async fn cancel_run(&self, run_id: &str, output: Value) -> Result<RollupOutcome, StoreError>;

  /// Accept `seq` if it is greater than every sequence seen for the run.
  async fn advance_sequence(&self, run_id: &str, seq: u64) -> Result<bool, StoreError>;

  async fn get_run_status(&self, run_id: &str) -> Result<RunStatusView, StoreError>;

  async fn get_task(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError>;

  /// Tasks of a run in dispatch order.
  async fn run_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

  /// Release the underlying resources.
  async fn close(&self);
}
