mod events;
mod health;
mod runs;
mod workflows;

pub use events::stream_events;
pub use health::health;
pub use runs::{cancel_run, get_run, list_patches};
pub use workflows::{create_workflow, get_workflow, list_runs, list_workflows, start_run};
