use conductor_config::ConfigError;
use conductor_store::StoreError;

/// Error type for bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
  /// The transport connection could not be established or was lost.
  #[error("transport unavailable: {0}")]
  TransportUnavailable(String),

  #[error("failed to publish to {subject}: {reason}")]
  Publish { subject: String, reason: String },

  #[error("failed to subscribe to {subject}: {reason}")]
  Subscribe { subject: String, reason: String },

  /// An inbound payload did not decode into the subject's message type.
  #[error("malformed message on {subject}: {reason}")]
  MalformedMessage { subject: String, reason: String },

  #[error("failed to encode message: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("invalid dag: {0}")]
  InvalidDag(#[from] ConfigError),

  #[error("run {0} was cancelled")]
  RunCancelled(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl BusError {
  /// The error refers to a workflow, run or task that does not exist.
  pub fn is_not_found(&self) -> bool {
    matches!(self, BusError::Store(e) if e.is_not_found())
  }

  /// The run was cancelled, either in this process or in the store.
  pub fn is_cancelled(&self) -> bool {
    match self {
      BusError::RunCancelled(_) => true,
      BusError::Store(e) => e.is_cancelled(),
      _ => false,
    }
  }
}
