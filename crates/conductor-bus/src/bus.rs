use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_config::{Dag, TaskDef, WorkflowSpec};
use conductor_store::{
  Overrides, PatchRecord, ProvenanceStore, RollupOutcome, TaskRecord, TaskStatus,
};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Span, debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::messages::{self, LogEntry, PatchEnvelope, PlanRequest, TaskRequest};
use crate::subject;
use crate::transport::{Message, Transport};

/// Handler bound to a subscription. Invoked once per inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
  async fn handle(&self, message: Message);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
  F: Fn(Message) -> Fut + Send + Sync,
  Fut: Future<Output = ()> + Send,
{
  async fn handle(&self, message: Message) {
    (self)(message).await
  }
}

/// A task request that was published.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedTask {
  pub run_id: String,
  pub task_id: String,
  pub task_type: String,
  pub attempt: u32,
  /// Deadline declared on the task itself.
  pub timeout_ms: Option<u64>,
}

impl From<&TaskRecord> for DispatchedTask {
  fn from(task: &TaskRecord) -> Self {
    Self {
      run_id: task.run_id.clone(),
      task_id: task.task_id.clone(),
      task_type: task.task_type.clone(),
      attempt: task.attempt,
      timeout_ms: task.payload.timeout_ms(),
    }
  }
}

/// A task whose request could not be published. It was recorded as failed,
/// so the run still settles.
#[derive(Debug, Clone, PartialEq)]
pub struct UndeliveredTask {
  pub run_id: String,
  pub task_id: String,
  pub attempt: u32,
  pub outcome: RollupOutcome,
}

/// Result of [`MessageBus::dispatch_tasks`].
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
  /// Tasks whose request was published, in dispatch order.
  pub dispatched: Vec<DispatchedTask>,
  pub undelivered: Vec<UndeliveredTask>,
}

/// Result of [`MessageBus::apply_patch_and_retry`].
#[derive(Debug, Clone)]
pub struct RetryOutcome {
  /// The run's task list after the patch.
  pub tasks: Vec<TaskDef>,
  /// The audit record, `None` when the patch targeted an unknown task.
  pub patch: Option<PatchRecord>,
  /// The re-published task, if it had been dispatched before.
  pub retried: Option<DispatchedTask>,
  /// Set instead of `retried` when the retry could not be published.
  pub undelivered: Option<UndeliveredTask>,
}

enum Delivery {
  Sent(DispatchedTask),
  Failed(UndeliveredTask),
}

/// Pub/sub wrapper with the orchestration operations on top.
///
/// Inbound messages are handled concurrently, each in its own task, bounded
/// by a shared semaphore. All spawned work is tracked so [`shutdown`] can
/// wait for in-flight handlers.
///
/// [`shutdown`]: MessageBus::shutdown
pub struct MessageBus {
  transport: Arc<dyn Transport>,
  store: Arc<dyn ProvenanceStore>,
  permits: Arc<Semaphore>,
  tracker: TaskTracker,
  shutdown: CancellationToken,
  runs: DashMap<String, CancellationToken>,
}

impl MessageBus {
  pub fn new(
    transport: Arc<dyn Transport>,
    store: Arc<dyn ProvenanceStore>,
    max_concurrent_handlers: usize,
  ) -> Self {
    Self {
      transport,
      store,
      permits: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
      tracker: TaskTracker::new(),
      shutdown: CancellationToken::new(),
      runs: DashMap::new(),
    }
  }

  pub fn store(&self) -> &Arc<dyn ProvenanceStore> {
    &self.store
  }

  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  /// Token cancelled when the bus shuts down.
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Spawn background work that shutdown waits for.
  pub fn spawn<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tracker.spawn(future);
  }

  /// Bind `handler` to a subject or wildcard pattern.
  ///
  /// Returns once the subscription is active. A listener task then spawns one
  /// handler per message; a failing or panicking handler never stops it.
  pub async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<(), BusError>
  where
    H: MessageHandler + 'static,
  {
    let mut stream = self.transport.subscribe(pattern).await?;
    let handler = Arc::new(handler);
    let permits = self.permits.clone();
    let tracker = self.tracker.clone();
    let shutdown = self.shutdown.clone();
    let pattern = pattern.to_string();

    debug!(pattern = %pattern, "subscribed");

    self.tracker.spawn(async move {
      loop {
        let message = tokio::select! {
          _ = shutdown.cancelled() => break,
          message = stream.next() => match message {
            Some(message) => message,
            None => break,
          },
        };

        let permit = tokio::select! {
          _ = shutdown.cancelled() => break,
          permit = permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => break,
          },
        };

        let handler = handler.clone();
        tracker.spawn(async move {
          handler.handle(message).await;
          drop(permit);
        });
      }

      debug!(pattern = %pattern, "subscription listener stopped");
    });

    Ok(())
  }

  /// Fire-and-forget publish of a JSON message.
  pub async fn publish<T: Serialize>(&self, subject: &str, message: &T) -> Result<(), BusError> {
    let payload = messages::encode(message)?;
    self.transport.publish(subject, None, payload).await
  }

  /// Mirror a log entry onto `workflow.logs.stream`. Failures are only logged.
  pub async fn publish_log(&self, entry: LogEntry) {
    if let Err(e) = self.publish(subject::LOGS_STREAM, &entry).await {
      debug!(error = %e, "failed to publish log entry");
    }
  }

  /// Create a run and ask the planner for its DAG. Does not wait for planning.
  #[instrument(skip_all, fields(workflow_id = %workflow_id, run_id))]
  pub async fn start_run(
    &self,
    workflow_id: &str,
    spec: &WorkflowSpec,
    overrides: &Overrides,
  ) -> Result<String, BusError> {
    let run_id = Uuid::new_v4().to_string();
    Span::current().record("run_id", run_id.as_str());

    self
      .store
      .create_run_node(&run_id, workflow_id, spec, overrides)
      .await?;
    self.run_token(&run_id);

    let request = PlanRequest {
      text: spec
        .description()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Run workflow {workflow_id}")),
      workflow_id: workflow_id.to_string(),
      run_id: run_id.clone(),
      reply_to: subject::PLAN_RESPONSE.to_string(),
    };

    if let Err(e) = self.publish(subject::PLAN_REQUEST, &request).await {
      error!(error = %e, "failed to request a plan");
      let output = json!({"error": format!("plan request failed: {e}")});
      if let Err(e) = self.store.cancel_run(&run_id, output).await {
        error!(error = %e, "failed to close run after plan request failure");
      }
      return Err(e);
    }

    info!("run started");
    Ok(run_id)
  }

  /// Create one pending task per DAG entry and publish its request, in
  /// declaration order. No dependency scheduling happens here.
  ///
  /// A request that cannot be published fails its task and dispatch carries
  /// on with the next one.
  #[instrument(skip_all, fields(run_id = %run_id, tasks = dag.len()))]
  pub async fn dispatch_tasks(&self, run_id: &str, dag: &Dag) -> Result<DispatchOutcome, BusError> {
    dag.validate()?;
    if self.is_run_cancelled(run_id) {
      return Err(BusError::RunCancelled(run_id.to_string()));
    }

    self.store.record_dag(run_id, dag).await?;
    let token = self.run_token(run_id);

    let mut outcome = DispatchOutcome::default();
    for task in &dag.tasks {
      if token.is_cancelled() {
        warn!(dispatched = outcome.dispatched.len(), "run cancelled during dispatch");
        self.close_cancelled(run_id).await?;
        return Err(BusError::RunCancelled(run_id.to_string()));
      }

      let record = self.store.create_task_node(run_id, task).await?;
      match self.deliver(&record).await {
        Delivery::Sent(task) => outcome.dispatched.push(task),
        Delivery::Failed(task) => outcome.undelivered.push(task),
      }
    }

    // A cancel that raced the last create may have missed those tasks.
    if token.is_cancelled() {
      self.close_cancelled(run_id).await?;
      return Err(BusError::RunCancelled(run_id.to_string()));
    }

    info!(undelivered = outcome.undelivered.len(), "tasks dispatched");
    Ok(outcome)
  }

  /// Audit the patch, mutate the run's snapshot and re-publish the corrected
  /// task. Unknown targets change nothing and publish nothing.
  ///
  /// A patch that would leave the task without a routable type is rejected
  /// with [`BusError::InvalidDag`] before anything is recorded.
  #[instrument(skip_all, fields(run_id = %run_id, task_id = %patch.task_id))]
  pub async fn apply_patch_and_retry(
    &self,
    run_id: &str,
    patch: &PatchEnvelope,
  ) -> Result<RetryOutcome, BusError> {
    if self.is_run_cancelled(run_id) {
      return Err(BusError::RunCancelled(run_id.to_string()));
    }

    let task_id = patch.task_id.as_str();
    let run = self.store.get_run(run_id).await?;
    if let Some(task) = run.spec.task(task_id) {
      task.patched(&patch.patch)?;
    }

    let Some(record) = self.store.record_patch(run_id, task_id, &patch.patch).await? else {
      warn!("patch targets an unknown task, ignoring");
      return Ok(RetryOutcome {
        tasks: run.spec.tasks,
        patch: None,
        retried: None,
        undelivered: None,
      });
    };

    let tasks = self.store.apply_patch(run_id, task_id, &patch.patch).await?;

    let (retried, undelivered) = match self.store.get_task(run_id, task_id).await {
      Ok(task) => match self.deliver(&task).await {
        Delivery::Sent(task) => (Some(task), None),
        Delivery::Failed(task) => (None, Some(task)),
      },
      // Patched before it was ever dispatched: the dispatch picks it up.
      Err(e) if e.is_not_found() => (None, None),
      Err(e) => return Err(e.into()),
    };

    info!(patch_id = %record.id, retried = retried.is_some(), "patch applied");
    Ok(RetryOutcome {
      tasks,
      patch: Some(record),
      retried,
      undelivered,
    })
  }

  /// Publish a task's request. When that fails the task is failed with a
  /// `publish_failure` diagnostic. If even that write fails the task stays
  /// pending and is reported as sent, leaving it to its deadline.
  async fn deliver(&self, record: &TaskRecord) -> Delivery {
    let sent = DispatchedTask::from(record);
    let Err(error) = self.send_task(&record.run_id, &record.payload).await else {
      return Delivery::Sent(sent);
    };

    warn!(task_id = %record.task_id, error = %error, "failed to publish task request, failing task");
    let output = json!({"error": error.to_string(), "kind": "publish_failure"});
    match self
      .store
      .record_task_result(&record.run_id, &record.task_id, TaskStatus::Fail, output)
      .await
    {
      Ok(outcome) => Delivery::Failed(UndeliveredTask {
        run_id: sent.run_id,
        task_id: sent.task_id,
        attempt: sent.attempt,
        outcome,
      }),
      Err(e) => {
        error!(task_id = %record.task_id, error = %e, "failed to record publish failure");
        Delivery::Sent(sent)
      }
    }
  }

  async fn send_task(&self, run_id: &str, task: &TaskDef) -> Result<(), BusError> {
    let request = TaskRequest {
      run_id: run_id.to_string(),
      task_id: task.id.clone(),
      payload: task.clone(),
    };
    let payload = messages::encode(&request)?;
    let reply = subject::task_response(&task.task_type);

    self
      .transport
      .publish(&subject::task_request(&task.task_type), Some(&reply), payload)
      .await
  }

  async fn close_cancelled(&self, run_id: &str) -> Result<(), BusError> {
    self
      .store
      .cancel_run(run_id, json!({"error": "run cancelled"}))
      .await?;
    Ok(())
  }

  /// Cancellation token of a run, created on first use.
  pub fn run_token(&self, run_id: &str) -> CancellationToken {
    self
      .runs
      .entry(run_id.to_string())
      .or_insert_with(|| self.shutdown.child_token())
      .clone()
  }

  pub fn is_run_cancelled(&self, run_id: &str) -> bool {
    self
      .runs
      .get(run_id)
      .map(|token| token.is_cancelled())
      .unwrap_or(false)
  }

  /// Runs currently holding a cancellation token.
  pub fn tracked_runs(&self) -> usize {
    self.runs.len()
  }

  /// Cancel a run's token. Dispatches and retries for the run stop publishing.
  pub fn cancel_run_token(&self, run_id: &str) {
    self.run_token(run_id).cancel();
  }

  /// Drop the token of a finished run. Timers already armed keep their own
  /// clone; a later retry registers a fresh token.
  pub fn forget_run(&self, run_id: &str) {
    self.runs.remove(run_id);
  }

  /// Stop listeners, wait for in-flight handlers and close the transport.
  pub async fn shutdown(&self) {
    self.shutdown.cancel();
    self.tracker.close();
    self.tracker.wait().await;

    if let Err(e) = self.transport.flush().await {
      warn!(error = %e, "failed to flush transport");
    }
    if let Err(e) = self.transport.close().await {
      warn!(error = %e, "failed to close transport");
    }
    info!("message bus stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::InMemoryTransport;
  use conductor_store::MemoryStore;

  fn bus() -> MessageBus {
    MessageBus::new(
      Arc::new(InMemoryTransport::default()),
      Arc::new(MemoryStore::new()),
      4,
    )
  }

  #[tokio::test]
  async fn test_unknown_runs_register_no_token() {
    let bus = bus();
    let patch = PatchEnvelope {
      task_id: "t1".to_string(),
      patch: Default::default(),
    };

    let err = bus.apply_patch_and_retry("ghost", &patch).await.unwrap_err();
    assert!(err.is_not_found());
    let dag = Dag::new(vec![TaskDef::new("t1", "build")]);
    let err = bus.dispatch_tasks("ghost", &dag).await.unwrap_err();
    assert!(err.is_not_found());

    assert_eq!(bus.tracked_runs(), 0);
  }

  #[tokio::test]
  async fn test_forget_run_drops_the_token() {
    let bus = bus();
    let token = bus.run_token("r1");
    assert_eq!(bus.tracked_runs(), 1);

    bus.forget_run("r1");
    assert_eq!(bus.tracked_runs(), 0);
    assert!(!bus.is_run_cancelled("r1"));
    assert!(!token.is_cancelled());
  }
}
