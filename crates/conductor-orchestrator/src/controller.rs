use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conductor_bus::messages::{
  AutofixRequest, AutofixResponse, PlanResponse, ReportedStatus, TaskResponse,
};
use conductor_bus::{BusError, DispatchedTask, Message, MessageBus, UndeliveredTask, subject};
use conductor_store::{
  Overrides, ProvenanceStore, RollupOutcome, RunStatus, RunStatusView, TaskStatus,
};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::deadline::{effective_timeout, timeout_output};
use crate::error::OrchestratorError;
use crate::events::{ChannelNotifier, EventNotifier, WorkflowEvent, spawn_event_forwarder};
use crate::ledger::AutofixLedger;

/// Binds inbound plan, task and auto-fix responses to bus operations,
/// correlating them by run id.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

struct Inner {
  bus: Arc<MessageBus>,
  store: Arc<dyn ProvenanceStore>,
  config: OrchestratorConfig,
  notifier: Arc<dyn EventNotifier>,
  ledger: AutofixLedger,
  /// Runs whose plan was accepted by this process.
  planned: DashSet<String>,
}

impl Orchestrator {
  /// Create an orchestrator publishing its events onto the bus.
  pub fn new(bus: Arc<MessageBus>, config: OrchestratorConfig) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_event_forwarder(bus.clone(), rx);
    Self::with_notifier(bus, config, Arc::new(ChannelNotifier::new(tx)))
  }

  pub fn with_notifier(
    bus: Arc<MessageBus>,
    config: OrchestratorConfig,
    notifier: Arc<dyn EventNotifier>,
  ) -> Self {
    let store = bus.store().clone();
    Self {
      inner: Arc::new(Inner {
        bus,
        store,
        config,
        notifier,
        ledger: AutofixLedger::new(),
        planned: DashSet::new(),
      }),
    }
  }

  pub fn bus(&self) -> &Arc<MessageBus> {
    &self.inner.bus
  }

  pub fn store(&self) -> &Arc<dyn ProvenanceStore> {
    &self.inner.store
  }

  /// Subscribe to plan, task and auto-fix responses.
  pub async fn start(&self) -> Result<(), OrchestratorError> {
    self
      .route(subject::PLAN_RESPONSE, |inner, response: PlanResponse| async move {
        inner.on_plan_response(response).await
      })
      .await?;
    self
      .route(subject::TASK_RESPONSES, |inner, response: TaskResponse| async move {
        inner.on_task_response(response).await
      })
      .await?;
    self
      .route(subject::AUTOFIX_RESPONSE, |inner, response: AutofixResponse| async move {
        inner.on_autofix_response(response).await
      })
      .await?;

    info!("orchestrator listening");
    Ok(())
  }

  /// Subscribe `handle` to `pattern`, decoding each message as `T`.
  ///
  /// Undecodable messages are quarantined. Handler errors are logged and the
  /// message dropped; they never reach the listener.
  async fn route<T, F, Fut>(&self, pattern: &str, handle: F) -> Result<(), BusError>
  where
    T: DeserializeOwned + Send + 'static,
    F: Fn(Arc<Inner>, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), OrchestratorError>> + Send + 'static,
  {
    let inner = self.inner.clone();
    let handle = Arc::new(handle);

    self
      .inner
      .bus
      .subscribe(pattern, move |message: Message| {
        let inner = inner.clone();
        let handle = handle.clone();
        async move {
          let payload = match message.decode::<T>() {
            Ok(payload) => payload,
            Err(e) => {
              inner.quarantine(&message.subject, &e);
              return;
            }
          };
          if let Err(e) = handle(inner.clone(), payload).await {
            report(&message.subject, &e);
          }
        }
      })
      .await
  }

  /// Start a run of a stored workflow. Returns as soon as planning was
  /// requested.
  pub async fn start_run(
    &self,
    workflow_id: &str,
    overrides: &Overrides,
  ) -> Result<String, OrchestratorError> {
    let spec = self.inner.store.get_workflow_spec(workflow_id).await?;
    let run_id = self.inner.bus.start_run(workflow_id, &spec, overrides).await?;

    self.inner.notify(WorkflowEvent::RunStarted {
      run_id: run_id.clone(),
      workflow_id: workflow_id.to_string(),
    });
    Ok(run_id)
  }

  /// Cancel a run: stop its dispatches and timers and fail unfinished tasks.
  #[instrument(skip(self))]
  pub async fn cancel_run(&self, run_id: &str) -> Result<RunStatusView, OrchestratorError> {
    let inner = &self.inner;
    inner.store.get_run(run_id).await?;

    inner.bus.cancel_run_token(run_id);
    let outcome = inner
      .store
      .cancel_run(run_id, json!({"error": "run cancelled"}))
      .await?;
    // The store rejects late work from here on.
    inner.forget_run(run_id);
    inner.ledger.forget_run(run_id);

    info!("run cancelled");
    inner.notify(WorkflowEvent::RunCancelled {
      run_id: run_id.to_string(),
    });
    if outcome.finished() {
      inner.notify_finished(run_id, &outcome);
    }

    Ok(inner.store.get_run_status(run_id).await?)
  }

  pub async fn handle_plan_response(&self, response: PlanResponse) -> Result<(), OrchestratorError> {
    self.inner.clone().on_plan_response(response).await
  }

  pub async fn handle_task_response(&self, response: TaskResponse) -> Result<(), OrchestratorError> {
    self.inner.clone().on_task_response(response).await
  }

  pub async fn handle_autofix_response(
    &self,
    response: AutofixResponse,
  ) -> Result<(), OrchestratorError> {
    self.inner.clone().on_autofix_response(response).await
  }

  /// Stop listening, wait for in-flight handlers and close the transport.
  pub async fn shutdown(&self) {
    self.inner.bus.shutdown().await;
  }
}

fn report(subject: &str, error: &OrchestratorError) {
  if error.is_not_found() {
    warn!(subject, error = %error, "dropping message for unknown target");
  } else if error.is_cancelled() {
    debug!(subject, error = %error, "dropping message for cancelled run");
  } else {
    error!(subject, error = %error, "message handling failed");
  }
}

/// A recorded task result.
struct Recorded {
  outcome: RollupOutcome,
  /// The store kept failing, so the task was failed with that error instead.
  forced: bool,
}

impl Inner {
  fn notify(&self, event: WorkflowEvent) {
    self.notifier.notify(event);
  }

  fn quarantine(&self, subject: &str, error: &dyn std::error::Error) {
    warn!(subject, error = %error, "quarantined message");
    self.notify(WorkflowEvent::MessageQuarantined {
      subject: subject.to_string(),
      reason: error.to_string(),
    });
  }

  fn forget_run(&self, run_id: &str) {
    self.bus.forget_run(run_id);
    self.planned.remove(run_id);
  }

  /// Accept `seq` for the run, or report a replay.
  async fn accept_sequence(&self, run_id: &str, seq: Option<u64>) -> Result<bool, OrchestratorError> {
    match seq {
      Some(seq) => {
        let fresh = self.store.advance_sequence(run_id, seq).await?;
        if !fresh {
          debug!(run_id, seq, "dropping replayed message");
        }
        Ok(fresh)
      }
      None => Ok(true),
    }
  }

  #[instrument(skip_all, fields(run_id = %response.run_id))]
  async fn on_plan_response(self: Arc<Self>, response: PlanResponse) -> Result<(), OrchestratorError> {
    let run_id = response.run_id.as_str();
    let run = self.store.get_run(run_id).await?;

    if !self.accept_sequence(run_id, response.seq).await? {
      return Ok(());
    }
    if run.status != RunStatus::Running || self.bus.is_run_cancelled(run_id) {
      debug!(status = run.status.as_str(), "dropping plan for inactive run");
      return Ok(());
    }
    let seen = !self.planned.insert(run_id.to_string());
    if seen || !self.store.run_tasks(run_id).await?.is_empty() {
      debug!("dropping duplicate plan");
      return Ok(());
    }

    let outcome = match self.bus.dispatch_tasks(run_id, &response.dag).await {
      Ok(outcome) => outcome,
      Err(BusError::InvalidDag(e)) => {
        warn!(error = %e, "planner returned an invalid dag, failing run");
        let outcome = self
          .store
          .cancel_run(run_id, json!({"error": format!("invalid plan: {e}")}))
          .await?;
        if outcome.finished() {
          self.notify_finished(run_id, &outcome);
        }
        return Ok(());
      }
      Err(e) => {
        // Nothing was dispatched for the plan; a redelivery may try again.
        if self.store.run_tasks(run_id).await.map_or(true, |t| t.is_empty()) {
          self.planned.remove(run_id);
        }
        return Err(e.into());
      }
    };

    self.notify(WorkflowEvent::TasksDispatched {
      run_id: run_id.to_string(),
      task_ids: outcome.dispatched.iter().map(|t| t.task_id.clone()).collect(),
    });
    for task in &outcome.dispatched {
      self.arm_deadline(task);
    }
    for task in &outcome.undelivered {
      self.settle_undelivered(task);
    }

    Ok(())
  }

  #[instrument(skip_all, fields(run_id = %response.run_id, task_id = %response.task_id))]
  async fn on_task_response(self: Arc<Self>, response: TaskResponse) -> Result<(), OrchestratorError> {
    let TaskResponse {
      run_id,
      task_id,
      status,
      output,
    } = response;

    if self.bus.is_run_cancelled(&run_id) {
      debug!("dropping result for cancelled run");
      return Ok(());
    }

    if status == ReportedStatus::Running {
      let task = self.store.mark_task_running(&run_id, &task_id).await?;
      if task.status == TaskStatus::Running {
        self.notify(WorkflowEvent::TaskRunning { run_id, task_id });
      }
      return Ok(());
    }

    let status = TaskStatus::from(status);
    let recorded = self.record_result(&run_id, &task_id, status, output.clone()).await?;
    let task = self.store.get_task(&run_id, &task_id).await?;
    info!(status = task.status.as_str(), attempt = task.attempt, "task result recorded");

    self.notify(WorkflowEvent::TaskCompleted {
      run_id: run_id.clone(),
      task_id: task_id.clone(),
      status: task.status,
      attempt: task.attempt,
    });

    // A store failure is no defect of the task itself.
    if task.status == TaskStatus::Fail && !recorded.forced {
      self.request_autofix(&run_id, &task_id, task.attempt, output).await?;
    }
    if recorded.outcome.finished() {
      self.notify_finished(&run_id, &recorded.outcome);
    }

    Ok(())
  }

  /// Record a result, retrying transaction failures with linear backoff. On
  /// exhaustion the task is force-failed with the failure as its output.
  async fn record_result(
    &self,
    run_id: &str,
    task_id: &str,
    status: TaskStatus,
    output: Value,
  ) -> Result<Recorded, OrchestratorError> {
    let attempts = self.config.store_retry_attempts.max(1);
    let mut tries = 0;

    loop {
      tries += 1;
      let error = match self
        .store
        .record_task_result(run_id, task_id, status, output.clone())
        .await
      {
        Ok(outcome) => {
          return Ok(Recorded {
            outcome,
            forced: false,
          });
        }
        Err(e) if e.is_transaction_failure() => e,
        Err(e) => return Err(e.into()),
      };

      if tries < attempts {
        warn!(error = %error, tries, "recording task result failed, retrying");
        tokio::time::sleep(self.config.store_retry_backoff * tries).await;
        continue;
      }

      error!(error = %error, tries, "recording task result failed, failing task");
      let diagnostic = json!({
        "error": error.to_string(),
        "kind": "store_transaction_failure",
      });
      let outcome = self
        .store
        .record_task_result(run_id, task_id, TaskStatus::Fail, diagnostic)
        .await?;
      return Ok(Recorded {
        outcome,
        forced: true,
      });
    }
  }

  async fn request_autofix(
    &self,
    run_id: &str,
    task_id: &str,
    attempt: u32,
    output: Value,
  ) -> Result<(), OrchestratorError> {
    if attempt >= self.config.max_patch_attempts {
      warn!(attempt, "patch attempts exhausted, leaving task failed");
      return Ok(());
    }

    self.ledger.record(run_id, task_id);
    let request = AutofixRequest {
      run_id: run_id.to_string(),
      task_id: task_id.to_string(),
      output,
    };
    self.bus.publish(subject::AUTOFIX_REQUEST, &request).await?;
    debug!("auto-fix requested");
    Ok(())
  }

  #[instrument(skip_all, fields(task_id = %response.patch.task_id))]
  async fn on_autofix_response(self: Arc<Self>, response: AutofixResponse) -> Result<(), OrchestratorError> {
    let task_id = response.patch.task_id.as_str();
    let run_id = match response.run_id.clone().or_else(|| self.ledger.resolve(task_id)) {
      Some(run_id) => run_id,
      None => {
        warn!("cannot correlate auto-fix response to a run, dropping");
        return Ok(());
      }
    };

    if !self.accept_sequence(&run_id, response.seq).await? {
      return Ok(());
    }
    if response.seq.is_none() && self.is_redelivered_patch(&run_id, &response).await? {
      debug!(run_id, "dropping redelivered patch");
      return Ok(());
    }
    if self.bus.is_run_cancelled(&run_id) {
      debug!(run_id, "dropping patch for cancelled run");
      return Ok(());
    }

    let outcome = match self.bus.apply_patch_and_retry(&run_id, &response.patch).await {
      Ok(outcome) => outcome,
      Err(BusError::InvalidDag(e)) => {
        self.ledger.settle(&run_id, task_id);
        self.quarantine(subject::AUTOFIX_RESPONSE, &e);
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };
    self.ledger.settle(&run_id, task_id);

    let Some(patch) = outcome.patch else {
      return Ok(());
    };
    let attempt = match (&outcome.retried, &outcome.undelivered) {
      (Some(task), _) => Some(task.attempt),
      (None, Some(task)) => Some(task.attempt),
      (None, None) => None,
    };
    self.notify(WorkflowEvent::PatchApplied {
      run_id: run_id.clone(),
      task_id: task_id.to_string(),
      patch_id: patch.id,
      attempt,
    });
    if let Some(task) = &outcome.retried {
      self.arm_deadline(task);
    }
    if let Some(task) = &outcome.undelivered {
      self.settle_undelivered(task);
    }

    Ok(())
  }

  /// The task is already waiting on a retry with exactly these updates.
  async fn is_redelivered_patch(
    &self,
    run_id: &str,
    response: &AutofixResponse,
  ) -> Result<bool, OrchestratorError> {
    let task_id = response.patch.task_id.as_str();
    let task = match self.store.get_task(run_id, task_id).await {
      Ok(task) => task,
      Err(e) if e.is_not_found() => return Ok(false),
      Err(e) => return Err(e.into()),
    };
    if task.status.is_terminal() {
      return Ok(false);
    }

    let last = self.store.last_patch(run_id, task_id).await?;
    Ok(last.is_some_and(|p| p.updates == response.patch.patch))
  }

  fn arm_deadline(self: &Arc<Self>, task: &DispatchedTask) {
    let Some(timeout) = effective_timeout(task, self.config.task_timeout) else {
      return;
    };

    let token = self.bus.run_token(&task.run_id);
    let inner = self.clone();
    let task = task.clone();

    self.bus.spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
          if let Err(e) = inner.expire(&task, timeout).await {
            error!(run_id = %task.run_id, task_id = %task.task_id, error = %e, "failed to expire task");
          }
        }
      }
    });
  }

  async fn expire(&self, task: &DispatchedTask, timeout: Duration) -> Result<(), OrchestratorError> {
    let Some(outcome) = self
      .store
      .expire_task(&task.run_id, &task.task_id, task.attempt, timeout_output(timeout))
      .await?
    else {
      return Ok(());
    };

    warn!(run_id = %task.run_id, task_id = %task.task_id, attempt = task.attempt, "task deadline exceeded");
    self.notify(WorkflowEvent::TaskCompleted {
      run_id: task.run_id.clone(),
      task_id: task.task_id.clone(),
      status: TaskStatus::Timeout,
      attempt: task.attempt,
    });
    if outcome.finished() {
      self.notify_finished(&task.run_id, &outcome);
    }
    Ok(())
  }

  /// Report a task whose request never left the process. It was already
  /// failed by the bus and is not sent for auto-fix.
  fn settle_undelivered(&self, task: &UndeliveredTask) {
    self.notify(WorkflowEvent::TaskCompleted {
      run_id: task.run_id.clone(),
      task_id: task.task_id.clone(),
      status: TaskStatus::Fail,
      attempt: task.attempt,
    });
    if task.outcome.finished() {
      self.notify_finished(&task.run_id, &task.outcome);
    }
  }

  fn notify_finished(&self, run_id: &str, outcome: &RollupOutcome) {
    info!(run_id, status = outcome.status.as_str(), "run finished");
    self.notify(WorkflowEvent::RunCompleted {
      run_id: run_id.to_string(),
      status: outcome.status,
      completed_at: outcome.completed_at,
    });

    // Armed timers hold their own token and a patch re-registers one, so a
    // failed run can still be retried.
    self.forget_run(run_id);
    if outcome.status == RunStatus::Success {
      self.ledger.forget_run(run_id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use conductor_bus::InMemoryTransport;
  use conductor_config::{Dag, TaskDef, WorkflowSpec};
  use conductor_store::MemoryStore;

  #[tokio::test]
  async fn test_finished_runs_are_forgotten() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(MessageBus::new(
      Arc::new(InMemoryTransport::default()),
      store.clone(),
      4,
    ));
    let config = OrchestratorConfig {
      task_timeout: None,
      max_patch_attempts: 1,
      ..Default::default()
    };
    let orchestrator = Orchestrator::new(bus, config);
    let mut spec = WorkflowSpec::new("wf1");
    spec.tasks = vec![TaskDef::new("t1", "build")];
    store.create_workflow_node(&spec).await.unwrap();

    let run_id = orchestrator.start_run("wf1", &Overrides::new()).await.unwrap();
    orchestrator
      .handle_plan_response(PlanResponse {
        workflow_id: None,
        run_id: run_id.clone(),
        dag: Dag::new(vec![TaskDef::new("t1", "build")]),
        seq: None,
      })
      .await
      .unwrap();
    assert!(orchestrator.inner.planned.contains(&run_id));
    assert_eq!(orchestrator.bus().tracked_runs(), 1);

    orchestrator
      .handle_task_response(TaskResponse {
        run_id: run_id.clone(),
        task_id: "t1".to_string(),
        status: ReportedStatus::Fail,
        output: json!({"err": "x"}),
      })
      .await
      .unwrap();

    assert!(orchestrator.inner.planned.is_empty());
    assert_eq!(orchestrator.bus().tracked_runs(), 0);
  }
}
