use std::time::Duration;

use conductor_bus::DispatchedTask;
use serde_json::{Value, json};

/// Deadline for a dispatched task: its own `timeoutMs`, else the default.
pub(crate) fn effective_timeout(task: &DispatchedTask, default: Option<Duration>) -> Option<Duration> {
  task.timeout_ms.map(Duration::from_millis).or(default)
}

/// Output recorded on a task whose deadline passed.
pub(crate) fn timeout_output(timeout: Duration) -> Value {
  json!({
    "error": "deadline exceeded",
    "timeoutMs": timeout.as_millis() as u64,
  })
}
