use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use conductor_bus::BusError;
use conductor_config::ConfigError;
use conductor_orchestrator::OrchestratorError;
use conductor_store::StoreError;
use serde::Serialize;
use tracing::error;

/// Error type for API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),

  #[error("invalid workflow: {0}")]
  InvalidWorkflow(#[from] ConfigError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Orchestrator(#[from] OrchestratorError),

  #[error(transparent)]
  Bus(#[from] BusError),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
  code: &'static str,
  message: String,
}

impl ApiError {
  fn status(&self) -> (StatusCode, &'static str) {
    match self {
      ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
      ApiError::InvalidWorkflow(_) => (StatusCode::BAD_REQUEST, "invalid_workflow"),
      ApiError::Store(e) if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
      ApiError::Orchestrator(e) if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
      ApiError::Orchestrator(e) if e.is_cancelled() => (StatusCode::CONFLICT, "run_cancelled"),
      ApiError::Store(e) if e.is_cancelled() => (StatusCode::CONFLICT, "run_cancelled"),
      ApiError::Bus(e) if e.is_cancelled() => (StatusCode::CONFLICT, "run_cancelled"),
      ApiError::Orchestrator(OrchestratorError::Bus(BusError::TransportUnavailable(_)))
      | ApiError::Bus(BusError::TransportUnavailable(_)) => {
        (StatusCode::SERVICE_UNAVAILABLE, "transport_unavailable")
      }
      _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, code) = self.status();
    if status.is_server_error() {
      error!(error = %self, "request failed");
    }

    let body = ErrorBody {
      code,
      message: self.to_string(),
    };
    (status, Json(body)).into_response()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_codes() {
    let unknown = ApiError::Store(StoreError::UnknownRun("r1".to_string()));
    assert_eq!(unknown.into_response().status(), StatusCode::NOT_FOUND);

    let invalid = ApiError::InvalidWorkflow(ConfigError::DuplicateTask("t1".to_string()));
    assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

    let down = ApiError::Bus(BusError::TransportUnavailable("closed".to_string()));
    assert_eq!(down.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

    let cancelled = ApiError::Orchestrator(OrchestratorError::Bus(BusError::RunCancelled(
      "r1".to_string(),
    )));
    assert_eq!(cancelled.into_response().status(), StatusCode::CONFLICT);
    let cancelled = ApiError::Store(StoreError::RunCancelled("r1".to_string()));
    assert_eq!(cancelled.into_response().status(), StatusCode::CONFLICT);

    let broken = ApiError::Store(StoreError::Serialization(
      serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
    ));
    assert_eq!(
      broken.into_response().status(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
  }
}
