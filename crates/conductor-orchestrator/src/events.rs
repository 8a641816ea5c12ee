//! Workflow events and notifiers.
//!
//! Events are emitted on every state change the orchestrator makes. The
//! default notifier forwards them, in order, to `workflow.events.<kind>` and
//! mirrors the notable ones onto the log stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conductor_bus::messages::{LogEntry, LogLevel};
use conductor_bus::{MessageBus, subject};
use conductor_store::{RunStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Events emitted while runs progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
  RunStarted {
    run_id: String,
    workflow_id: String,
  },

  TasksDispatched {
    run_id: String,
    task_ids: Vec<String>,
  },

  /// An executor reported that it picked the task up.
  TaskRunning { run_id: String, task_id: String },

  TaskCompleted {
    run_id: String,
    task_id: String,
    status: TaskStatus,
    attempt: u32,
  },

  PatchApplied {
    run_id: String,
    task_id: String,
    patch_id: String,
    /// Attempt number of the re-dispatched task, if it was re-dispatched.
    attempt: Option<u32>,
  },

  RunCompleted {
    run_id: String,
    status: RunStatus,
    completed_at: Option<DateTime<Utc>>,
  },

  RunCancelled { run_id: String },

  /// An inbound message failed validation and was dropped.
  MessageQuarantined { subject: String, reason: String },
}

impl WorkflowEvent {
  /// Subject suffix, e.g. `run.started`.
  pub fn kind(&self) -> &'static str {
    match self {
      WorkflowEvent::RunStarted { .. } => "run.started",
      WorkflowEvent::TasksDispatched { .. } => "tasks.dispatched",
      WorkflowEvent::TaskRunning { .. } => "task.running",
      WorkflowEvent::TaskCompleted { .. } => "task.completed",
      WorkflowEvent::PatchApplied { .. } => "patch.applied",
      WorkflowEvent::RunCompleted { .. } => "run.completed",
      WorkflowEvent::RunCancelled { .. } => "run.cancelled",
      WorkflowEvent::MessageQuarantined { .. } => "message.quarantined",
    }
  }

  pub fn subject(&self) -> String {
    subject::event(self.kind())
  }

  /// Log stream entry for events an observer should see.
  pub fn log_entry(&self) -> Option<LogEntry> {
    let (level, message) = match self {
      WorkflowEvent::RunStarted {
        run_id,
        workflow_id,
      } => (
        LogLevel::Info,
        format!("run {run_id} of workflow {workflow_id} started"),
      ),
      WorkflowEvent::TaskCompleted {
        run_id,
        task_id,
        status: TaskStatus::Fail,
        attempt,
      } => (
        LogLevel::Warn,
        format!("task {task_id} of run {run_id} failed on attempt {attempt}"),
      ),
      WorkflowEvent::TaskCompleted {
        run_id,
        task_id,
        status: TaskStatus::Timeout,
        ..
      } => (
        LogLevel::Warn,
        format!("task {task_id} of run {run_id} timed out"),
      ),
      WorkflowEvent::PatchApplied {
        run_id, task_id, ..
      } => (
        LogLevel::Info,
        format!("patch applied to task {task_id} of run {run_id}"),
      ),
      WorkflowEvent::RunCompleted { run_id, status, .. } => {
        let level = match status {
          RunStatus::Failed => LogLevel::Error,
          _ => LogLevel::Info,
        };
        (level, format!("run {run_id} {}", status.as_str()))
      }
      WorkflowEvent::RunCancelled { run_id } => {
        (LogLevel::Warn, format!("run {run_id} cancelled"))
      }
      WorkflowEvent::MessageQuarantined { subject, reason } => (
        LogLevel::Warn,
        format!("dropped malformed message on {subject}: {reason}"),
      ),
      _ => return None,
    };

    Some(LogEntry::new(level, message))
  }
}

/// Receives workflow events.
///
/// The orchestrator calls `notify` for each event; implementations decide
/// what to do with them. Must not block.
pub trait EventNotifier: Send + Sync {
  fn notify(&self, event: WorkflowEvent);
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
    Self { sender }
  }
}

impl EventNotifier for ChannelNotifier {
  fn notify(&self, event: WorkflowEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}

/// Publish events from `receiver` onto the bus, in order, until shutdown.
///
/// Events still queued at shutdown are flushed before the task ends.
pub fn spawn_event_forwarder(bus: Arc<MessageBus>, mut receiver: mpsc::UnboundedReceiver<WorkflowEvent>) {
  let shutdown = bus.shutdown_token();
  let publisher = bus.clone();

  bus.spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        event = receiver.recv() => match event {
          Some(event) => forward(&publisher, event).await,
          None => return,
        },
      }
    }

    while let Ok(event) = receiver.try_recv() {
      forward(&publisher, event).await;
    }
  });
}

async fn forward(bus: &MessageBus, event: WorkflowEvent) {
  if let Err(e) = bus.publish(&event.subject(), &event).await {
    debug!(error = %e, kind = event.kind(), "failed to publish workflow event");
  }
  if let Some(entry) = event.log_entry() {
    bus.publish_log(entry).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_event_wire_shape() {
    let event = WorkflowEvent::TaskCompleted {
      run_id: "r1".to_string(),
      task_id: "t1".to_string(),
      status: TaskStatus::Pass,
      attempt: 1,
    };

    assert_eq!(event.subject(), "workflow.events.task.completed");
    assert_eq!(
      serde_json::to_value(&event).unwrap(),
      json!({"event": "task_completed", "runId": "r1", "taskId": "t1", "status": "pass", "attempt": 1})
    );
  }

  #[test]
  fn test_log_levels() {
    let failed = WorkflowEvent::RunCompleted {
      run_id: "r1".to_string(),
      status: RunStatus::Failed,
      completed_at: None,
    };
    let entry = failed.log_entry().unwrap();
    assert_eq!(entry.level, LogLevel::Error);
    assert_eq!(entry.message, "run r1 failed");

    let passed = WorkflowEvent::TaskCompleted {
      run_id: "r1".to_string(),
      task_id: "t1".to_string(),
      status: TaskStatus::Pass,
      attempt: 1,
    };
    assert!(passed.log_entry().is_none());
  }

  #[tokio::test]
  async fn test_channel_notifier() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = ChannelNotifier::new(tx);

    notifier.notify(WorkflowEvent::RunCancelled {
      run_id: "r1".to_string(),
    });

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind(), "run.cancelled");
  }
}
