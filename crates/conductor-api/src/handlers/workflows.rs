use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use conductor_config::WorkflowSpec;
use conductor_store::{Overrides, ProvenanceStore, RunRecord, WorkflowSummary};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCreated {
  pub workflow_id: String,
  pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
  #[serde(default)]
  pub overrides: Overrides,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunScheduled {
  pub run_id: String,
  pub status: String,
}

/// Create or replace a workflow from a YAML or JSON document.
pub async fn create_workflow(
  State(state): State<AppState>,
  body: String,
) -> ApiResult<(StatusCode, Json<WorkflowCreated>)> {
  let spec = WorkflowSpec::from_yaml(&body)?;
  let record = state.store().create_workflow_node(&spec).await?;
  info!(workflow_id = %record.id, tasks = spec.tasks.len(), "workflow stored");

  Ok((
    StatusCode::CREATED,
    Json(WorkflowCreated {
      workflow_id: record.id,
      message: "workflow created".to_string(),
    }),
  ))
}

pub async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkflowSummary>>> {
  Ok(Json(state.store().list_workflows().await?))
}

pub async fn get_workflow(
  State(state): State<AppState>,
  Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowSpec>> {
  Ok(Json(state.store().get_workflow_spec(&workflow_id).await?))
}

/// Runs of a workflow, newest first.
pub async fn list_runs(
  State(state): State<AppState>,
  Path(workflow_id): Path<String>,
) -> ApiResult<Json<Vec<RunRecord>>> {
  state.store().get_workflow_spec(&workflow_id).await?;
  Ok(Json(state.store().list_runs(&workflow_id).await?))
}

/// Start a run. The body, `{"overrides": {...}}`, is optional.
pub async fn start_run(
  State(state): State<AppState>,
  Path(workflow_id): Path<String>,
  body: Bytes,
) -> ApiResult<(StatusCode, Json<RunScheduled>)> {
  let request: StartRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
    StartRunRequest::default()
  } else {
    serde_json::from_slice(&body)
      .map_err(|e| ApiError::BadRequest(format!("invalid run request: {e}")))?
  };

  let run_id = state
    .orchestrator
    .start_run(&workflow_id, &request.overrides)
    .await?;

  Ok((
    StatusCode::ACCEPTED,
    Json(RunScheduled {
      run_id,
      status: "scheduled".to_string(),
    }),
  ))
}
