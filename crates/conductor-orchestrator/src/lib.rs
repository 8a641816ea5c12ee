//! Conductor Orchestrator
//!
//! The controller that turns bus traffic into run progress:
//!
//! ```text
//! workflow.plan.response     -> dispatch_tasks
//! task.<type>.response       -> record_task_result (+ auto-fix request on fail)
//! workflow.autofix.response  -> apply_patch_and_retry
//! ```
//!
//! Correlation is by the run id carried in each message. On top of that the
//! orchestrator guards against replays (an optional `seq` per run, plus
//! duplicate plan and patch detection), arms a deadline per dispatched task
//! attempt, retries failed store transactions, and publishes a
//! [`WorkflowEvent`] for every state change it makes.

mod config;
mod controller;
mod deadline;
mod error;
mod events;
mod ledger;

pub use config::OrchestratorConfig;
pub use controller::Orchestrator;
pub use error::OrchestratorError;
pub use events::{ChannelNotifier, EventNotifier, WorkflowEvent, spawn_event_forwarder};
pub use ledger::AutofixLedger;
