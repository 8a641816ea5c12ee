use std::collections::HashSet;

use dashmap::DashMap;

/// Outstanding auto-fix requests, keyed by task id.
///
/// The generator may answer without a run id. Such a response is matched to
/// the single run that is waiting on a fix for that task id.
#[derive(Debug, Default)]
pub struct AutofixLedger {
  outstanding: DashMap<String, HashSet<String>>,
}

impl AutofixLedger {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record(&self, run_id: &str, task_id: &str) {
    self
      .outstanding
      .entry(task_id.to_string())
      .or_default()
      .insert(run_id.to_string());
  }

  /// The run waiting on a fix for `task_id`, if exactly one is.
  pub fn resolve(&self, task_id: &str) -> Option<String> {
    let runs = self.outstanding.get(task_id)?;
    if runs.len() == 1 {
      runs.iter().next().cloned()
    } else {
      None
    }
  }

  pub fn settle(&self, run_id: &str, task_id: &str) {
    self.outstanding.remove_if_mut(task_id, |_, runs| {
      runs.remove(run_id);
      runs.is_empty()
    });
  }

  /// Drop every outstanding request of a run.
  pub fn forget_run(&self, run_id: &str) {
    self.outstanding.retain(|_, runs| {
      runs.remove(run_id);
      !runs.is_empty()
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolves_only_unambiguous_tasks() {
    let ledger = AutofixLedger::new();
    assert_eq!(ledger.resolve("t1"), None);

    ledger.record("r1", "t1");
    assert_eq!(ledger.resolve("t1").as_deref(), Some("r1"));

    ledger.record("r2", "t1");
    assert_eq!(ledger.resolve("t1"), None);

    ledger.settle("r2", "t1");
    assert_eq!(ledger.resolve("t1").as_deref(), Some("r1"));

    ledger.settle("r1", "t1");
    assert_eq!(ledger.resolve("t1"), None);
  }

  #[test]
  fn test_forget_run() {
    let ledger = AutofixLedger::new();
    ledger.record("r1", "t1");
    ledger.record("r1", "t2");
    ledger.record("r2", "t2");

    ledger.forget_run("r1");

    assert_eq!(ledger.resolve("t1"), None);
    assert_eq!(ledger.resolve("t2").as_deref(), Some("r2"));
  }
}
