use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_config::{Dag, TaskDef, TaskUpdates, WorkflowSpec};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::locks::RunLocks;
use crate::state::RunState;
use crate::types::{
  Overrides, PatchRecord, RollupOutcome, RunRecord, RunStatus, RunStatusView, TaskRecord,
  TaskStatus, WorkflowRecord, WorkflowSummary,
};
use crate::{ProvenanceStore, StoreError};

/// SQLite-based store implementation.
///
/// Run mutations take the run's lock and then execute inside a single
/// transaction, so a failed write never leaves a half-applied rollup behind.
pub struct SqliteStore {
  pool: SqlitePool,
  locks: RunLocks,
}

#[derive(FromRow)]
struct WorkflowRow {
  id: String,
  name: String,
  spec: Json<WorkflowSpec>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<WorkflowRow> for WorkflowRecord {
  fn from(row: WorkflowRow) -> Self {
    Self {
      id: row.id,
      name: row.name,
      spec: row.spec.0,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

#[derive(FromRow)]
struct RunRow {
  id: String,
  workflow_id: String,
  spec: Json<WorkflowSpec>,
  overrides: Json<Overrides>,
  status: RunStatus,
  started_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
  cancelled_at: Option<DateTime<Utc>>,
  last_sequence: Option<i64>,
}

impl From<RunRow> for RunRecord {
  fn from(row: RunRow) -> Self {
    Self {
      id: row.id,
      workflow_id: row.workflow_id,
      spec: row.spec.0,
      overrides: row.overrides.0,
      status: row.status,
      started_at: row.started_at,
      completed_at: row.completed_at,
      cancelled_at: row.cancelled_at,
      last_sequence: row.last_sequence.map(|s| s as u64),
    }
  }
}

#[derive(FromRow)]
struct TaskRow {
  run_id: String,
  task_id: String,
  task_type: String,
  payload: Json<TaskDef>,
  status: TaskStatus,
  attempt: i64,
  output: Option<Json<Value>>,
  started_at: DateTime<Utc>,
  completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for TaskRecord {
  fn from(row: TaskRow) -> Self {
    Self {
      run_id: row.run_id,
      task_id: row.task_id,
      task_type: row.task_type,
      payload: row.payload.0,
      status: row.status,
      attempt: row.attempt as u32,
      output: row.output.map(|o| o.0),
      started_at: row.started_at,
      completed_at: row.completed_at,
    }
  }
}

#[derive(FromRow)]
struct PatchRow {
  id: String,
  run_id: String,
  task_id: String,
  timestamp: DateTime<Utc>,
  updates: Json<TaskUpdates>,
}

impl From<PatchRow> for PatchRecord {
  fn from(row: PatchRow) -> Self {
    Self {
      id: row.id,
      run_id: row.run_id,
      task_id: row.task_id,
      timestamp: row.timestamp,
      updates: row.updates.0,
    }
  }
}

const RUN_COLUMNS: &str =
  "id, workflow_id, spec, overrides, status, started_at, completed_at, cancelled_at, last_sequence";
const TASK_COLUMNS: &str =
  "run_id, task_id, task_type, payload, status, attempt, output, started_at, completed_at";

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self {
      pool,
      locks: RunLocks::new(),
    }
  }

  /// Open (creating if missing) the database at `url`.
  ///
  /// SQLite serializes writers anyway, so the pool holds a single connection
  /// that is never recycled. This also keeps `sqlite::memory:` databases
  /// alive for the lifetime of the store.
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;

    debug!(url, "connected to sqlite");
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  /// Load a run under its lock, mutate it and write it back in one
  /// transaction. An error from `f` rolls everything back.
  async fn mutate<T, F>(&self, run_id: &str, f: F) -> Result<T, StoreError>
  where
    F: FnOnce(&mut RunState) -> Result<T, StoreError> + Send,
    T: Send,
  {
    let _guard = self.locks.acquire(run_id).await;
    let mut tx = self.pool.begin().await?;

    let mut state = load_state(&mut tx, run_id).await?;
    let value = f(&mut state)?;
    save_state(&mut tx, &state).await?;

    tx.commit().await?;
    Ok(value)
  }
}

async fn load_run(conn: &mut SqliteConnection, run_id: &str) -> Result<RunRecord, StoreError> {
  let row: Option<RunRow> = sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await?;

  row
    .map(RunRecord::from)
    .ok_or_else(|| StoreError::UnknownRun(run_id.to_string()))
}

async fn load_tasks(conn: &mut SqliteConnection, run_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
  let rows: Vec<TaskRow> = sqlx::query_as(&format!(
    "SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ? ORDER BY position ASC"
  ))
  .bind(run_id)
  .fetch_all(&mut *conn)
  .await?;

  Ok(rows.into_iter().map(TaskRecord::from).collect())
}

async fn load_state(conn: &mut SqliteConnection, run_id: &str) -> Result<RunState, StoreError> {
  let run = load_run(conn, run_id).await?;
  let tasks = load_tasks(conn, run_id).await?;
  Ok(RunState::new(run, tasks))
}

async fn save_state(conn: &mut SqliteConnection, state: &RunState) -> Result<(), StoreError> {
  let run = &state.run;
  sqlx::query(
    r#"
    UPDATE runs
    SET spec = ?, status = ?, completed_at = ?, cancelled_at = ?, last_sequence = ?
    WHERE id = ?
    "#,
  )
  .bind(Json(&run.spec))
  .bind(run.status)
  .bind(run.completed_at)
  .bind(run.cancelled_at)
  .bind(run.last_sequence.map(|s| s as i64))
  .bind(&run.id)
  .execute(&mut *conn)
  .await?;

  for (position, task) in state.tasks.iter().enumerate() {
    sqlx::query(
      r#"
      INSERT INTO tasks (run_id, task_id, position, task_type, payload, status, attempt, output, started_at, completed_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT (run_id, task_id) DO UPDATE SET
        position = excluded.position,
        task_type = excluded.task_type,
        payload = excluded.payload,
        status = excluded.status,
        attempt = excluded.attempt,
        output = excluded.output,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at
      "#,
    )
    .bind(&task.run_id)
    .bind(&task.task_id)
    .bind(position as i64)
    .bind(&task.task_type)
    .bind(Json(&task.payload))
    .bind(task.status)
    .bind(task.attempt as i64)
    .bind(task.output.as_ref().map(Json))
    .bind(task.started_at)
    .bind(task.completed_at)
    .execute(&mut *conn)
    .await?;
  }

  Ok(())
}

#[async_trait]
impl ProvenanceStore for SqliteStore {
  async fn create_workflow_node(&self, spec: &WorkflowSpec) -> Result<WorkflowRecord, StoreError> {
    let now = Utc::now();
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      INSERT INTO workflows (id, name, spec, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?)
      ON CONFLICT (id) DO UPDATE SET
        name = excluded.name,
        spec = excluded.spec,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(spec.workflow_id())
    .bind(&spec.name)
    .bind(Json(spec))
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let row: WorkflowRow = sqlx::query_as(
      "SELECT id, name, spec, created_at, updated_at FROM workflows WHERE id = ?",
    )
    .bind(spec.workflow_id())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row.into())
  }

  async fn get_workflow_spec(&self, workflow_id: &str) -> Result<WorkflowSpec, StoreError> {
    let row: Option<(Json<WorkflowSpec>,)> =
      sqlx::query_as("SELECT spec FROM workflows WHERE id = ?")
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

    row
      .map(|(spec,)| spec.0)
      .ok_or_else(|| StoreError::UnknownWorkflow(workflow_id.to_string()))
  }

  async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
    let rows: Vec<WorkflowRow> = sqlx::query_as(
      "SELECT id, name, spec, created_at, updated_at FROM workflows ORDER BY id ASC",
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|row| WorkflowSummary::from(&WorkflowRecord::from(row)))
        .collect(),
    )
  }

  async fn create_run_node(
    &self,
    run_id: &str,
    workflow_id: &str,
    spec: &WorkflowSpec,
    overrides: &Overrides,
  ) -> Result<RunRecord, StoreError> {
    let mut tx = self.pool.begin().await?;

    let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM workflows WHERE id = ?")
      .bind(workflow_id)
      .fetch_optional(&mut *tx)
      .await?;
    if exists.is_none() {
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

    sqlx::query(
      r#"
      INSERT INTO runs (id, workflow_id, spec, overrides, status, started_at, completed_at, last_sequence)
      VALUES (?, ?, ?, ?, ?, ?, NULL, NULL)
      "#,
    )
    .bind(&record.id)
    .bind(&record.workflow_id)
    .bind(Json(&record.spec))
    .bind(Json(&record.overrides))
    .bind(record.status)
    .bind(record.started_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(record)
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
    let mut conn = self.pool.acquire().await?;
    load_run(&mut conn, run_id).await
  }

  async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>, StoreError> {
    let rows: Vec<RunRow> = sqlx::query_as(&format!(
      "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_id = ? ORDER BY started_at DESC"
    ))
    .bind(workflow_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(RunRecord::from).collect())
  }

  async fn record_dag(&self, run_id: &str, dag: &Dag) -> Result<(), StoreError> {
    self
      .mutate(run_id, |state| {
        state.record_dag(dag);
        Ok(())
      })
      .await
  }

  async fn create_task_node(&self, run_id: &str, task: &TaskDef) -> Result<TaskRecord, StoreError> {
    self
      .mutate(run_id, |state| state.upsert_task(task, Utc::now()))
      .await
  }

  async fn mark_task_running(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
    self
      .mutate(run_id, |state| state.mark_running(task_id, Utc::now()))
      .await
  }

  async fn record_task_result(
    &self,
    run_id: &str,
    task_id: &str,
    status: TaskStatus,
    output: Value,
  ) -> Result<RollupOutcome, StoreError> {
    self
      .mutate(run_id, |state| {
        state.record_result(task_id, status, output, Utc::now())
      })
      .await
  }

  async fn expire_task(
    &self,
    run_id: &str,
    task_id: &str,
    attempt: u32,
    output: Value,
  ) -> Result<Option<RollupOutcome>, StoreError> {
    self
      .mutate(run_id, |state| state.expire(task_id, attempt, output, Utc::now()))
      .await
  }

  async fn record_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Option<PatchRecord>, StoreError> {
    let _guard = self.locks.acquire(run_id).await;
    let mut tx = self.pool.begin().await?;

    let run = load_run(&mut tx, run_id).await?;
    if run.cancelled_at.is_some() {
      return Err(StoreError::RunCancelled(run_id.to_string()));
    }
    if run.spec.task(task_id).is_none() {
      return Ok(None);
    }

    let patch = PatchRecord {
      id: Uuid::new_v4().to_string(),
      run_id: run_id.to_string(),
      task_id: task_id.to_string(),
      timestamp: Utc::now(),
      updates: updates.clone(),
    };

    sqlx::query(
      r#"
      INSERT INTO patches (id, run_id, task_id, timestamp, updates)
      VALUES (?, ?, ?, ?, ?)
      "#,
    )
    .bind(&patch.id)
    .bind(&patch.run_id)
    .bind(&patch.task_id)
    .bind(patch.timestamp)
    .bind(Json(&patch.updates))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(patch))
  }

  async fn apply_patch(
    &self,
    run_id: &str,
    task_id: &str,
    updates: &TaskUpdates,
  ) -> Result<Vec<TaskDef>, StoreError> {
    self
      .mutate(run_id, |state| {
        state.apply_patch(task_id, updates, Utc::now())?;
        Ok(state.run.spec.tasks.clone())
      })
      .await
  }

  async fn last_patch(&self, run_id: &str, task_id: &str) -> Result<Option<PatchRecord>, StoreError> {
    let row: Option<PatchRow> = sqlx::query_as(
      r#"
      SELECT id, run_id, task_id, timestamp, updates
      FROM patches
      WHERE run_id = ? AND task_id = ?
      ORDER BY seq DESC
      LIMIT 1
      "#,
    )
    .bind(run_id)
    .bind(task_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(row.map(PatchRecord::from))
  }

  async fn list_patches(&self, run_id: &str) -> Result<Vec<PatchRecord>, StoreError> {
    let rows: Vec<PatchRow> = sqlx::query_as(
      r#"
      SELECT id, run_id, task_id, timestamp, updates
      FROM patches
      WHERE run_id = ?
      ORDER BY seq ASC
      "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(rows.into_iter().map(PatchRecord::from).collect())
  }

  async fn cancel_run(&self, run_id: &str, output: Value) -> Result<RollupOutcome, StoreError> {
    self
      .mutate(run_id, |state| Ok(state.cancel(&output, Utc::now())))
      .await
  }

  async fn advance_sequence(&self, run_id: &str, seq: u64) -> Result<bool, StoreError> {
    self
      .mutate(run_id, |state| Ok(state.advance_sequence(seq)))
      .await
  }

  async fn get_run_status(&self, run_id: &str) -> Result<RunStatusView, StoreError> {
    let mut conn = self.pool.acquire().await?;
    let state = load_state(&mut conn, run_id).await?;
    Ok(RunStatusView::new(&state.run, &state.tasks))
  }

  async fn get_task(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ? AND task_id = ?"
    ))
    .bind(run_id)
    .bind(task_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(TaskRecord::from)
      .ok_or_else(|| StoreError::unknown_task(run_id, task_id))
  }

  async fn run_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
    let mut conn = self.pool.acquire().await?;
    load_run(&mut conn, run_id).await?;
    load_tasks(&mut conn, run_id).await
  }

  async fn close(&self) {
    self.pool.close().await;
  }
}
