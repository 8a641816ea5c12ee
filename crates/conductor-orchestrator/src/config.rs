use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator tuning, the `orchestrator` section of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// Upper bound on concurrently running message handlers.
  pub max_concurrent_handlers: usize,

  /// Deadline for tasks that do not declare `timeoutMs`. `None` disables it.
  #[serde(with = "humantime_serde")]
  pub task_timeout: Option<Duration>,

  /// Attempts per task (first dispatch included) after which a failure no
  /// longer requests an auto-fix.
  pub max_patch_attempts: u32,

  /// Tries for recording a task result before the task is force-failed.
  pub store_retry_attempts: u32,

  /// Base delay between result recording tries, multiplied by the try number.
  #[serde(with = "humantime_serde")]
  pub store_retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_concurrent_handlers: 64,
      task_timeout: Some(Duration::from_secs(15 * 60)),
      max_patch_attempts: 3,
      store_retry_attempts: 3,
      store_retry_backoff: Duration::from_millis(200),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_humantime_fields() {
    let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
      "task_timeout": "90s",
      "store_retry_backoff": "50ms",
      "max_patch_attempts": 5
    }))
    .unwrap();

    assert_eq!(config.task_timeout, Some(Duration::from_secs(90)));
    assert_eq!(config.store_retry_backoff, Duration::from_millis(50));
    assert_eq!(config.max_patch_attempts, 5);
    assert_eq!(config.max_concurrent_handlers, 64);
  }

  #[test]
  fn test_null_timeout_disables_deadlines() {
    let config: OrchestratorConfig =
      serde_json::from_value(serde_json::json!({"task_timeout": null})).unwrap();
    assert_eq!(config.task_timeout, None);
  }
}
