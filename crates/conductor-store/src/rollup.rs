//! Run status rollup.
//!
//! A run's status is a pure function of its tasks' statuses:
//! - `success` iff every task passed
//! - `failed` iff at least one task failed (or timed out) and none is still
//!   pending or running
//! - `running` otherwise, including a run with no tasks yet

use chrono::{DateTime, Utc};

use crate::types::{RollupOutcome, RunStatus, TaskStatus};

/// Derive a run status from its tasks' statuses. Order does not matter.
pub fn rollup<I>(statuses: I) -> RunStatus
where
  I: IntoIterator<Item = TaskStatus>,
{
  let mut any = false;
  let mut all_passed = true;

  for status in statuses {
    any = true;
    match status {
      TaskStatus::Pending | TaskStatus::Running => return RunStatus::Running,
      TaskStatus::Pass => {}
      TaskStatus::Fail | TaskStatus::Timeout => all_passed = false,
    }
  }

  if !any {
    RunStatus::Running
  } else if all_passed {
    RunStatus::Success
  } else {
    RunStatus::Failed
  }
}

/// Status of a run whose unfinished tasks were just force-failed.
///
/// A run cancelled before any task was dispatched has nothing to roll up and
/// ends `failed`.
pub(crate) fn rollup_cancelled<I>(statuses: I) -> RunStatus
where
  I: IntoIterator<Item = TaskStatus>,
{
  let mut statuses = statuses.into_iter().peekable();
  if statuses.peek().is_none() {
    RunStatus::Failed
  } else {
    rollup(statuses)
  }
}

/// Settle a run onto a freshly computed status.
///
/// `completed_at` is stamped on the first transition into a terminal status
/// and kept afterwards; going back to `running` clears it.
pub(crate) fn settle(
  previous: RunStatus,
  completed_at: Option<DateTime<Utc>>,
  status: RunStatus,
  now: DateTime<Utc>,
) -> RollupOutcome {
  let completed_at = if status.is_terminal() {
    completed_at.or(Some(now))
  } else {
    None
  };

  RollupOutcome {
    previous,
    status,
    completed_at,
  }
}
