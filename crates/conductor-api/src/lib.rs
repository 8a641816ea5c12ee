//! Conductor API
//!
//! A thin HTTP layer over the orchestrator and its store:
//!
//! ```text
//! GET  /health
//! POST /api/workflows                  create or replace (YAML or JSON)
//! GET  /api/workflows
//! GET  /api/workflows/{id}
//! GET  /api/workflows/{id}/runs
//! POST /api/workflows/{id}/runs        start a run
//! GET  /api/runs/{id}                  run status with task summaries
//! GET  /api/runs/{id}/patches
//! POST /api/runs/{id}/cancel
//! GET  /api/events                     SSE stream of workflow events
//! ```

mod error;
mod handlers;
mod state;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Build the API router.
pub fn router(state: AppState) -> Router {
  let api = Router::new()
    .route(
      "/workflows",
      get(handlers::list_workflows).post(handlers::create_workflow),
    )
    .route("/workflows/{id}", get(handlers::get_workflow))
    .route(
      "/workflows/{id}/runs",
      get(handlers::list_runs).post(handlers::start_run),
    )
    .route("/runs/{id}", get(handlers::get_run))
    .route("/runs/{id}/patches", get(handlers::list_patches))
    .route("/runs/{id}/cancel", post(handlers::cancel_run))
    .route("/events", get(handlers::stream_events));

  Router::new()
    .route("/health", get(handlers::health))
    .nest("/api", api)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
  listener: TcpListener,
  router: Router,
  shutdown: CancellationToken,
) -> std::io::Result<()> {
  if let Ok(addr) = listener.local_addr() {
    info!(%addr, "api listening");
  }

  axum::serve(listener, router)
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
