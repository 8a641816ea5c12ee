use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conductor_config::{Dag, TaskDef, TaskUpdates, WorkflowSpec};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::state::RunState;
use crate::types::{
  Overrides, PatchRecord, RollupOutcome, RunRecord, RunStatus, RunStatusView, TaskRecord,
  TaskStatus, WorkflowRecord, WorkflowSummary,
};
use crate::{ProvenanceStore, StoreError};

struct RunEntry {
  state: RunState,
  patches: Vec<PatchRecord>,
}

/// In-process store.
///
/// Each run lives behind its own mutex, which doubles as the per-run
/// serialization point for read-modify-write operations.
#[derive(Default)]
pub struct MemoryStore {
  workflows: RwLock<BTreeMap<String, WorkflowRecord>>,
  runs: DashMap<String, Arc<Mutex<RunEntry>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entry(&self, run_id: &str) -> Result<Arc<Mutex<RunEntry>>, StoreError> {
    self
      .runs
      .get(run_id)
      .map(|e| e.value().clone())
      .ok_or_else(|| StoreError::UnknownRun(run_id.to_string()))
  }
}

#[async_trait]
impl ProvenanceStore for MemoryStore {
  async fn create_workflow_node(&self, spec: &WorkflowSpec) -> Result<WorkflowRecord, StoreError> {
    let now = Utc::now();
    let mut workflows = self.workflows.write().await;
    let id = spec.workflow_id().to_string();
    let created_at = workflows.get(&id).map(|w| w.created_at).unwrap_or(now);

    let record = WorkflowRecord {
      id: id.clone(),
      name: spec.name.clone(),
      spec: spec.clone(),
      created_at,
      updated_at: now,
    };
    workflows.insert(id, record.clone());
    Ok(record)
  }

  async fn get_workflow_spec(&self, workflow_id: &str) -> Result<WorkflowSpec, StoreError> {
    self
      .workflows
      .read()
      .await
      .get(workflow_id)
      .map(|w| w.spec.clone())
      .ok_or_else(|| StoreError::UnknownWorkflow(workflow_id.to_string()))
  }

  async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
    let workflows = self.workflows.read().await;
    Ok(workflows.values().map(WorkflowSummary::from).collect())
  }

  async fn create_run_node(
    &self,
    run_id: &str,
    workflow_id: &str,
    spec: &WorkflowSpec,
    overrides: &Overrides,
  ) -> Result<RunRecord, StoreError> {
    if !self.workflows.read().await.contains_key(workflow_id) {
      return Err(StoreError::UnknownWorkflow(workflow_id.to_string()));
    }

    let record = RunRecord {
      id: run_id.to_string(),
      workflow_id: workflow_id.to_string(),
      spec: spec.clone(),
      overrides: overrides.clone(),
      status: RunStatus::Running,
      started_at: Utc::now(),
      completed_at: None,
      cancelled_at: None,
      last_sequence: None,
    };
    let entry = RunEntry {
      state: RunState::new(record.clone(), Vec::new()),
      patches: Vec::new(),
    };
    self.runs.insert(run_id.to_string(), Arc::new(Mutex::new(entry)));
    Ok(record)
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    Ok(entry.state.run.clone())
  }

  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>, StoreError> {
    let entries: Vec<_> = self.runs.iter().map(|e| e.value().clone()).collect();

    let mut runs = Vec::new();
    for entry in entries {
      let entry = entry.lock().await;
      if entry.state.run.workflow_id == workflow_id {
        runs.push(entry.state.run.clone());
      }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(runs)
  }

  async fn record_dag(&self, run_id: &str, dag: &Dag) -> Result<(), StoreError> {
    let entry = self.entry(run_id)?;
    entry.lock().await.state.record_dag(dag);
    Ok(())
  }

  async fn create_task_node(&self, run_id: &str, task: &TaskDef) -> Result<TaskRecord, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.upsert_task(task, Utc::now())
  }

  async fn mark_task_running(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.mark_running(task_id, Utc::now())
  }

  async fn record_task_result(
    &self,
    run_id: &str,
    task_id: &str,
    status: TaskStatus,
    output: Value,
  ) -> Result<RollupOutcome, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.record_result(task_id, status, output, Utc::now())
  }

  async fn expire_task(
    &self,
    run_id: &str,
    task_id: &str,
    attempt: u32,
    output: Value,
  ) -> Result<Option<RollupOutcome>, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.expire(task_id, attempt, output, Utc::now())
  }

  async fn record_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Option<PatchRecord>, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.ensure_active()?;
    if !entry.state.has_task(task_id) {
      return Ok(None);
    }

    let patch = PatchRecord {
      id: Uuid::new_v4().to_string(),
      run_id: run_id.to_string(),
      task_id: task_id.to_string(),
      timestamp: Utc::now(),
      updates: updates.clone(),
    };
    entry.patches.push(patch.clone());
    Ok(Some(patch))
  }

  async fn apply_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Vec<TaskDef>, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    entry.state.apply_patch(task_id, updates, Utc::now())?;
    Ok(entry.state.run.spec.tasks.clone())
  }

  async fn last_patch(&self, run_id: &str, task_id: &str) -> Result<Option<PatchRecord>, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    Ok(entry.patches.iter().rev().find(|p| p.task_id == task_id).cloned())
  }

  async fn list_patches(&self, run_id: &str) -> Result<Vec<PatchRecord>, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    Ok(entry.patches.clone())
  }

  async fn cancel_run(&self, run_id: &str, output: Value) -> Result<RollupOutcome, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    Ok(entry.state.cancel(&output, Utc::now()))
  }

  async fn advance_sequence(&self, run_id: &str, seq: u64) -> Result<bool, StoreError> {
    let entry = self.entry(run_id)?;
    let mut entry = entry.lock().await;
    Ok(entry.state.advance_sequence(seq))
  }

  async fn get_run_status(&self, run_id: &str) -> Result<RunStatusView, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    Ok(RunStatusView::new(&entry.state.run, &entry.state.tasks))
  }

  async fn get_task(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    entry
      .state
      .tasks
      .iter()
      .find(|t| t.task_id == task_id)
      .cloned()
      .ok_or_else(|| StoreError::unknown_task(run_id, task_id))
  }

  async fn run_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
    let entry = self.entry(run_id)?;
    let entry = entry.lock().await;
    Ok(entry.state.tasks.clone())
  }

  async fn close(&self) {}
}
