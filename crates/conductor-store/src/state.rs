use chrono::{DateTime, Utc};
use conductor_config::{Dag, TaskDef, TaskUpdates};
use serde_json::Value;

use crate::error::StoreError;
use crate::rollup::{rollup, rollup_cancelled, settle};
use crate::types::{RollupOutcome, RunRecord, RunStatus, TaskRecord, TaskStatus};

/// A run and its tasks, loaded under the run's lock.
///
/// All run mutations go through here so both stores share one set of
/// transition rules. Callers persist the whole state afterwards.
#[derive(Debug, Clone)]
pub(crate) struct RunState {
  pub run: RunRecord,
  /// Tasks in dispatch order.
  pub tasks: Vec<TaskRecord>,
}

impl RunState {
  pub fn new(run: RunRecord, tasks: Vec<TaskRecord>) -> Self {
    Self { run, tasks }
  }

  /// Reject work for a cancelled run.
  pub fn ensure_active(&self) -> Result<(), StoreError> {
    match self.run.cancelled_at {
      Some(_) => Err(StoreError::RunCancelled(self.run.id.clone())),
      None => Ok(()),
    }
  }

  fn task_mut(&mut self, task_id: &str) -> Result<&mut TaskRecord, StoreError> {
    let run_id = &self.run.id;
    self
      .tasks
      .iter_mut()
      .find(|t| t.task_id == task_id)
      .ok_or_else(|| StoreError::unknown_task(run_id, task_id))
  }

  /// Recompute the run status from the current task set.
  fn settle(&mut self, now: DateTime<Utc>) -> RollupOutcome {
    let status = rollup(self.tasks.iter().map(|t| t.status));
    self.apply(settle(self.run.status, self.run.completed_at, status, now))
  }

  fn apply(&mut self, outcome: RollupOutcome) -> RollupOutcome {
    self.run.status = outcome.status;
    self.run.completed_at = outcome.completed_at;
    outcome
  }

  pub fn record_dag(&mut self, dag: &Dag) {
    self.run.spec.tasks = dag.tasks.clone();
  }

  pub fn upsert_task(&mut self, task: &TaskDef, now: DateTime<Utc>) -> Result<TaskRecord, StoreError> {
    self.ensure_active()?;
    let record = match self.tasks.iter_mut().find(|t| t.task_id == task.id) {
      Some(existing) => {
        let attempt = existing.attempt + 1;
        *existing = TaskRecord::new(&self.run.id, task, attempt, now);
        existing.clone()
      }
      None => {
        let record = TaskRecord::new(&self.run.id, task, 1, now);
        self.tasks.push(record.clone());
        record
      }
    };
    self.settle(now);
    Ok(record)
  }

  pub fn mark_running(&mut self, task_id: &str, now: DateTime<Utc>) -> Result<TaskRecord, StoreError> {
    self.ensure_active()?;
    let task = self.task_mut(task_id)?;
    if task.status == TaskStatus::Pending {
      task.status = TaskStatus::Running;
      task.started_at = now;
    }
    Ok(task.clone())
  }

  pub fn record_result(
    &mut self,
    task_id: &str,
    status: TaskStatus,
    output: Value,
    now: DateTime<Utc>,
  ) -> Result<RollupOutcome, StoreError> {
    self.ensure_active()?;
    let task = self.task_mut(task_id)?;
    task.status = status;
    task.output = Some(output);
    task.completed_at = status.is_terminal().then_some(now);
    Ok(self.settle(now))
  }

  pub fn expire(
    &mut self,
    task_id: &str,
    attempt: u32,
    output: Value,
    now: DateTime<Utc>,
  ) -> Result<Option<RollupOutcome>, StoreError> {
    if self.run.cancelled_at.is_some() {
      return Ok(None);
    }
    let task = self.task_mut(task_id)?;
    if task.attempt != attempt || task.status.is_terminal() {
      return Ok(None);
    }
    task.status = TaskStatus::Timeout;
    task.output = Some(output);
    task.completed_at = Some(now);
    Ok(Some(self.settle(now)))
  }

  /// Whether `task_id` is part of the run's task list.
  pub fn has_task(&self, task_id: &str) -> bool {
    self.run.spec.task(task_id).is_some()
  }

  /// Patch the snapshot and reset the dispatched task for another attempt.
  ///
  /// Returns `false` when the task is unknown; nothing is changed then.
  pub fn apply_patch(
    &mut self,
    task_id: &str,
    updates: &TaskUpdates,
    now: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    self.ensure_active()?;
    if !self.run.spec.apply_patch(task_id, updates) {
      return Ok(false);
    }

    let patched = self.run.spec.task(task_id).cloned();
    if let Some(patched) = patched
      && let Some(existing) = self.tasks.iter_mut().find(|t| t.task_id == task_id)
    {
      let attempt = existing.attempt + 1;
      *existing = TaskRecord::new(&self.run.id, &patched, attempt, now);
    }

    self.settle(now);
    Ok(true)
  }

  pub fn cancel(&mut self, output: &Value, now: DateTime<Utc>) -> RollupOutcome {
    self.run.cancelled_at.get_or_insert(now);
    for task in self.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
      task.status = TaskStatus::Fail;
      task.output = Some(output.clone());
      task.completed_at = Some(now);
    }
    let status = rollup_cancelled(self.tasks.iter().map(|t| t.status));
    self.apply(settle(self.run.status, self.run.completed_at, status, now))
  }

  pub fn advance_sequence(&mut self, seq: u64) -> bool {
    match self.run.last_sequence {
      Some(last) if seq <= last => false,
      _ => {
        self.run.last_sequence = Some(seq);
        true
      }
    }
  }

  pub fn is_running(&self) -> bool {
    self.run.status == RunStatus::Running
  }
}
