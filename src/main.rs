mod settings;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use conductor_api::AppState;
use conductor_bus::{InMemoryTransport, MessageBus, Transport, subject};
use conductor_config::WorkflowSpec;
use conductor_orchestrator::Orchestrator;
use conductor_store::{MemoryStore, ProvenanceStore, SqliteStore};

use crate::settings::{Settings, TransportKind};

/// Conductor - plans, dispatches and repairs workflow tasks over a message bus
#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the settings file (default: ./conductor.yaml when present)
  #[arg(long, short, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the orchestrator and its HTTP API until Ctrl-C
  Serve,

  /// Apply the store schema and exit
  Migrate,

  /// Validate a workflow document
  Check {
    /// Path to the workflow file (YAML or JSON)
    workflow_file: PathBuf,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  // A missing .env is fine.
  let _ = dotenvy::dotenv();
  let cli = Cli::parse();

  match cli.command {
    Commands::Check { workflow_file } => check(&workflow_file),
    Commands::Migrate => {
      let settings = Settings::load(cli.config.as_deref())?;
      telemetry::init(&settings.log);
      migrate(&settings).await
    }
    Commands::Serve => {
      let settings = Settings::load(cli.config.as_deref())?;
      telemetry::init(&settings.log);
      serve(settings).await
    }
  }
}

async fn serve(settings: Settings) -> Result<()> {
  let store = open_store(&settings.database_url).await?;
  serve_with(&settings, store).await
}

/// Run the service on `store`, then close it however the service ended.
async fn serve_with(settings: &Settings, store: Arc<dyn ProvenanceStore>) -> Result<()> {
  let result = run_service(settings, store.clone()).await;
  store.close().await;
  info!("stopped");
  result
}

async fn run_service(settings: &Settings, store: Arc<dyn ProvenanceStore>) -> Result<()> {
  let transport = connect_transport(settings).await?;

  let bus = Arc::new(MessageBus::new(
    transport,
    store,
    settings.orchestrator.max_concurrent_handlers,
  ));
  let orchestrator = Orchestrator::new(bus, settings.orchestrator.clone());
  let result = run_api(settings, &orchestrator).await;
  // In-flight handlers finish before the store goes away.
  orchestrator.shutdown().await;
  result
}

async fn run_api(settings: &Settings, orchestrator: &Orchestrator) -> Result<()> {
  orchestrator
    .start()
    .await
    .context("failed to subscribe to response subjects")?;

  let listener = TcpListener::bind(settings.listen)
    .await
    .with_context(|| format!("failed to bind {}", settings.listen))?;
  let shutdown = CancellationToken::new();
  let app = conductor_api::router(AppState::new(orchestrator.clone(), shutdown.clone()));

  let server = tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      let result = conductor_api::serve(listener, app, shutdown.clone()).await;
      shutdown.cancel();
      result
    }
  });

  let signal = tokio::select! {
    signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c"),
    _ = shutdown.cancelled() => {
      warn!("api server stopped unexpectedly");
      Ok(())
    }
  };

  info!("shutting down");
  shutdown.cancel();
  let exit = server
    .await
    .context("api server task failed")
    .and_then(|result| result.context("api server failed"));
  signal.and(exit)
}

async fn migrate(settings: &Settings) -> Result<()> {
  if settings.database_url == "memory" {
    info!("in-memory store has no schema to migrate");
    return Ok(());
  }

  let store = open_sqlite(&settings.database_url).await?;
  store.close().await;
  info!(database_url = %settings.database_url, "store migrated");
  Ok(())
}

fn check(workflow_file: &Path) -> Result<()> {
  let content = std::fs::read_to_string(workflow_file)
    .with_context(|| format!("failed to read workflow file: {}", workflow_file.display()))?;
  let spec = WorkflowSpec::from_yaml(&content)
    .with_context(|| format!("invalid workflow file: {}", workflow_file.display()))?;

  println!("workflow {} ({} tasks)", spec.workflow_id(), spec.tasks.len());
  for task in &spec.tasks {
    println!("  {} -> {}", task.id, subject::task_request(&task.task_type));
  }
  Ok(())
}

async fn open_store(database_url: &str) -> Result<Arc<dyn ProvenanceStore>> {
  if database_url == "memory" {
    info!("using in-memory store");
    return Ok(Arc::new(MemoryStore::new()));
  }
  Ok(Arc::new(open_sqlite(database_url).await?))
}

async fn open_sqlite(database_url: &str) -> Result<SqliteStore> {
  let store = SqliteStore::connect(database_url)
    .await
    .with_context(|| format!("failed to open store at {database_url}"))?;
  store.migrate().await.context("failed to migrate store")?;
  Ok(store)
}

async fn connect_transport(settings: &Settings) -> Result<Arc<dyn Transport>> {
  match settings.transport {
    TransportKind::Memory => {
      info!("using in-process transport");
      Ok(Arc::new(InMemoryTransport::default()))
    }
    TransportKind::Nats => connect_nats(&settings.nats_url).await,
  }
}

#[cfg(feature = "nats")]
async fn connect_nats(url: &str) -> Result<Arc<dyn Transport>> {
  let transport = conductor_bus::NatsTransport::connect(url)
    .await
    .with_context(|| format!("failed to connect to NATS at {url}"))?;
  info!(url, "connected to NATS");
  Ok(Arc::new(transport))
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(url: &str) -> Result<Arc<dyn Transport>> {
  anyhow::bail!("transport 'nats' ({url}) requires building conductor with the `nats` feature")
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicBool, Ordering};

  use async_trait::async_trait;
  use conductor_config::{Dag, TaskDef, TaskUpdates};
  use conductor_store::{
    Overrides, PatchRecord, RollupOutcome, RunRecord, RunStatusView, StoreError, TaskRecord,
    TaskStatus, WorkflowRecord, WorkflowSummary,
  };
  use serde_json::Value;

  use super::*;

  /// Remembers whether it was closed.
  #[derive(Default)]
  struct TrackedStore {
    inner: MemoryStore,
    closed: AtomicBool,
  }

  #[async_trait]
  impl ProvenanceStore for TrackedStore {
    async fn create_workflow_node(&self, spec: &WorkflowSpec) -> Result<WorkflowRecord, StoreError> {
      self.inner.create_workflow_node(spec).await
    }

    async fn get_workflow_spec(&self, workflow_id: &str) -> Result<WorkflowSpec, StoreError> {
      self.inner.get_workflow_spec(workflow_id).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
      self.inner.list_workflows().await
    }

    async fn create_run_node(
      &self,
      run_id: &str,
      workflow_id: &str,
      spec: &WorkflowSpec,
      overrides: &Overrides,
    ) -> Result<RunRecord, StoreError> {
      self.inner.create_run_node(run_id, workflow_id, spec, overrides).await
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
      self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<RunRecord>, StoreError> {
      self.inner.list_runs(workflow_id).await
    }

    async fn record_dag(&self, run_id: &str, dag: &Dag) -> Result<(), StoreError> {
      self.inner.record_dag(run_id, dag).await
    }

    async fn create_task_node(&self, run_id: &str, task: &TaskDef) -> Result<TaskRecord, StoreError> {
      self.inner.create_task_node(run_id, task).await
    }

    async fn mark_task_running(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
      self.inner.mark_task_running(run_id, task_id).await
    }

    async fn record_task_result(
      &self,
      run_id: &str,
      task_id: &str,
      status: TaskStatus,
      output: Value,
    ) -> Result<RollupOutcome, StoreError> {
      self.inner.record_task_result(run_id, task_id, status, output).await
    }

    async fn expire_task(
      &self,
      run_id: &str,
      task_id: &str,
      attempt: u32,
      output: Value,
    ) -> Result<Option<RollupOutcome>, StoreError> {
      self.inner.expire_task(run_id, task_id, attempt, output).await
    }

    async fn record_patch(
      &self,
      run_id: &str,
      task_id: &str,
      updates: &TaskUpdates,
    ) -> Result<Option<PatchRecord>, StoreError> {
      self.inner.record_patch(run_id, task_id, updates).await
    }

    async fn apply_patch(
      &self,
      run_id: &str,
      task_id: &str,
      updates: &TaskUpdates,
    ) -> Result<Vec<TaskDef>, StoreError> {
      self.inner.apply_patch(run_id, task_id, updates).await
    }

    async fn last_patch(&self, run_id: &str, task_id: &str) -> Result<Option<PatchRecord>, StoreError> {
      self.inner.last_patch(run_id, task_id).await
    }

    async fn list_patches(&self, run_id: &str) -> Result<Vec<PatchRecord>, StoreError> {
      self.inner.list_patches(run_id).await
    }

    async fn cancel_run(&self, run_id: &str, output: Value) -> Result<RollupOutcome, StoreError> {
      self.inner.cancel_run(run_id, output).await
    }

    async fn advance_sequence(&self, run_id: &str, seq: u64) -> Result<bool, StoreError> {
      self.inner.advance_sequence(run_id, seq).await
    }

    async fn get_run_status(&self, run_id: &str) -> Result<RunStatusView, StoreError> {
      self.inner.get_run_status(run_id).await
    }

    async fn get_task(&self, run_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
      self.inner.get_task(run_id, task_id).await
    }

    async fn run_tasks(&self, run_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
      self.inner.run_tasks(run_id).await
    }

    async fn close(&self) {
      self.closed.store(true, Ordering::SeqCst);
      self.inner.close().await
    }
  }

  #[tokio::test]
  async fn test_store_is_closed_when_bind_fails() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let settings = Settings {
      listen: taken.local_addr().unwrap(),
      ..Default::default()
    };
    let store = Arc::new(TrackedStore::default());

    let err = serve_with(&settings, store.clone()).await.unwrap_err();

    assert!(err.to_string().contains("failed to bind"));
    assert!(store.closed.load(Ordering::SeqCst));
  }

  #[cfg(not(feature = "nats"))]
  #[tokio::test]
  async fn test_store_is_closed_when_transport_fails() {
    let settings = Settings {
      transport: TransportKind::Nats,
      ..Default::default()
    };
    let store = Arc::new(TrackedStore::default());

    let err = serve_with(&settings, store.clone()).await.unwrap_err();

    assert!(err.to_string().contains("nats"));
    assert!(store.closed.load(Ordering::SeqCst));
  }
}
