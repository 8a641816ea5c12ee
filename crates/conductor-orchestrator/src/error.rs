use conductor_bus::BusError;
use conductor_store::StoreError;

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  #[error(transparent)]
  Bus(#[from] BusError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl OrchestratorError {
  /// The referenced workflow, run or task does not exist.
  pub fn is_not_found(&self) -> bool {
    match self {
      OrchestratorError::Bus(e) => e.is_not_found(),
      OrchestratorError::Store(e) => e.is_not_found(),
    }
  }

  /// The run was cancelled and takes no further work.
  pub fn is_cancelled(&self) -> bool {
    match self {
      OrchestratorError::Bus(e) => e.is_cancelled(),
      OrchestratorError::Store(e) => e.is_cancelled(),
    }
  }
}
