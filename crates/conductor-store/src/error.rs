/// Error type for provenance store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("unknown workflow: {0}")]
  UnknownWorkflow(String),

  #[error("unknown run: {0}")]
  UnknownRun(String),

  #[error("unknown task '{task_id}' in run {run_id}")]
  UnknownTask { run_id: String, task_id: String },

  #[error("run {0} was cancelled")]
  RunCancelled(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl StoreError {
  /// The referenced workflow, run or task does not exist.
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      StoreError::UnknownWorkflow(_) | StoreError::UnknownRun(_) | StoreError::UnknownTask { .. }
    )
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, StoreError::RunCancelled(_))
  }

  /// A read-modify-write failed and may succeed when retried.
  pub fn is_transaction_failure(&self) -> bool {
    matches!(self, StoreError::Database(_) | StoreError::Serialization(_))
  }

  pub(crate) fn unknown_task(run_id: &str, task_id: &str) -> Self {
    StoreError::UnknownTask {
      run_id: run_id.to_string(),
      task_id: task_id.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_classification() {
    assert!(StoreError::UnknownRun("r".into()).is_not_found());
    assert!(StoreError::unknown_task("r", "t").is_not_found());
    assert!(!StoreError::UnknownWorkflow("w".into()).is_transaction_failure());
    assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transaction_failure());
    assert!(StoreError::RunCancelled("r".into()).is_cancelled());
    assert!(!StoreError::RunCancelled("r".into()).is_transaction_failure());
  }
}
