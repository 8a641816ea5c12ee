use std::sync::Arc;

use conductor_bus::Transport;
use conductor_orchestrator::Orchestrator;
use conductor_store::ProvenanceStore;
use tokio_util::sync::CancellationToken;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
  pub orchestrator: Orchestrator,
  /// Cancelled when the server shuts down; ends open event streams.
  pub shutdown: CancellationToken,
}

impl AppState {
  pub fn new(orchestrator: Orchestrator, shutdown: CancellationToken) -> Self {
    Self {
      orchestrator,
      shutdown,
    }
  }

  pub fn store(&self) -> &Arc<dyn ProvenanceStore> {
    self.orchestrator.store()
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    self.orchestrator.bus().transport()
  }
}
