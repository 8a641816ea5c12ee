//! Per-run serialization.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Hands out one async mutex per run id.
///
/// Every read-modify-write on a run holds its guard for the whole operation,
/// so two task completions for the same run never compute the rollup from the
/// same stale sibling set. Different runs never contend. A run's entry is
/// dropped as soon as nobody holds or waits for its lock.
#[derive(Clone, Default)]
pub struct RunLocks {
  locks: Arc<LockMap>,
}

/// Held for the duration of one run mutation.
pub struct RunGuard {
  guard: Option<OwnedMutexGuard<()>>,
  run_id: String,
  locks: Arc<LockMap>,
}

impl RunLocks {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn acquire(&self, run_id: &str) -> RunGuard {
    // Clone the Arc out so the shard guard is released before awaiting.
    let lock = self.locks.entry(run_id.to_string()).or_default().clone();
    RunGuard {
      guard: Some(lock.lock_owned().await),
      run_id: run_id.to_string(),
      locks: self.locks.clone(),
    }
  }

  /// Runs with a live lock entry.
  pub fn len(&self) -> usize {
    self.locks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.locks.is_empty()
  }
}

impl Drop for RunGuard {
  fn drop(&mut self) {
    // Release first; the map then holds the only reference unless another
    // caller is already queued on this run.
    drop(self.guard.take());
    self
      .locks
      .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn test_same_run_is_serialized() {
    let locks = RunLocks::new();
    let guard = locks.acquire("run-1").await;

    let contender = {
      let locks = locks.clone();
      tokio::spawn(async move {
        let _guard = locks.acquire("run-1").await;
      })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!contender.is_finished());

    drop(guard);
    contender.await.unwrap();
  }

  #[tokio::test]
  async fn test_different_runs_do_not_contend() {
    let locks = RunLocks::new();
    let _first = locks.acquire("run-1").await;
    let _second = locks.acquire("run-2").await;
    assert_eq!(locks.len(), 2);
  }

  #[tokio::test]
  async fn test_released_locks_are_dropped() {
    let locks = RunLocks::new();
    for run in 0..100 {
      let _guard = locks.acquire(&format!("run-{run}")).await;
    }
    assert!(locks.is_empty());
  }

  #[tokio::test]
  async fn test_queued_waiter_keeps_the_entry() {
    let locks = RunLocks::new();
    let guard = locks.acquire("run-1").await;

    let waiter = {
      let locks = locks.clone();
      tokio::spawn(async move {
        let _guard = locks.acquire("run-1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    drop(guard);
    assert_eq!(locks.len(), 1);

    waiter.await.unwrap();
    assert!(locks.is_empty());
  }
}
