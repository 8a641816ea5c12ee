use axum::Json;
use axum::extract::{Path, State};
use conductor_store::{PatchRecord, ProvenanceStore, RunStatusView};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn get_run(
  State(state): State<AppState>,
  Path(run_id): Path<String>,
) -> ApiResult<Json<RunStatusView>> {
  Ok(Json(state.store().get_run_status(&run_id).await?))
}

/// Patch audit trail of a run, in application order.
pub async fn list_patches(
  State(state): State<AppState>,
  Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<PatchRecord>>> {
  state.store().get_run(&run_id).await?;
  Ok(Json(state.store().list_patches(&run_id).await?))
}

pub async fn cancel_run(
  State(state): State<AppState>,
  Path(run_id): Path<String>,
) -> ApiResult<Json<RunStatusView>> {
  Ok(Json(state.orchestrator.cancel_run(&run_id).await?))
}
