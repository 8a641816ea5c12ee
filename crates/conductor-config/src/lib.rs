//! Conductor Config
//!
//! This crate contains the serializable workflow documents for conductor.
//!
//! - A [`WorkflowSpec`] is the template a user uploads. It is stored as-is and
//!   never patched.
//! - A [`Dag`] is the flat task list the planner produces for one run.
//!
//! Both carry [`TaskDef`]s, which keep every field the author wrote so the
//! executors receive their payload untouched. Documents can be loaded from
//! YAML or JSON (JSON is accepted by the YAML loader).

mod dag;
mod error;
mod task;
mod workflow;

pub use dag::Dag;
pub use error::ConfigError;
pub use task::{TaskDef, TaskUpdates};
pub use workflow::WorkflowSpec;
