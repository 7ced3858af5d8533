use crate::task::EntryState;

use dashmap::DashSet;
use tracing::trace;

/// Set of task ids whose callers withdrew them and that have not been settled yet.
///
/// An id is inserted by a withdrawal and removed by whoever settles the entry
/// (admission skip, in-flight cancellation, dispatcher discard or shutdown drain).
/// A withdrawal that arrives after settlement removes its own id again, so once
/// the scheduler is quiescent the registry is empty.
#[derive(Debug, Default)]
pub(crate) struct CancellationRegistry {
  withdrawn: DashSet<u64>,
}

impl CancellationRegistry {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Adds the entry to the withdrawn set. Idempotent; a no-op for settled entries.
  pub(crate) fn mark_cancelled(&self, state: &EntryState) {
    let newly_inserted = self.withdrawn.insert(state.task_id);
    // Settlement stores its flag before clearing, so either it sees our id or we see its flag.
    if state.is_settled() {
      self.withdrawn.remove(&state.task_id);
      trace!(task_id = state.task_id, "Registry: entry already settled, withdrawal ignored.");
    } else if newly_inserted {
      trace!(task_id = state.task_id, "Registry: entry marked cancelled.");
    }
  }

  pub(crate) fn is_cancelled(&self, task_id: u64) -> bool {
    self.withdrawn.contains(&task_id)
  }

  pub(crate) fn clear(&self, task_id: u64) {
    if self.withdrawn.remove(&task_id).is_some() {
      trace!(%task_id, "Registry: cleared.");
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.withdrawn.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mark_is_idempotent() {
    let registry = CancellationRegistry::new();
    let state = EntryState::new();
    registry.mark_cancelled(&state);
    registry.mark_cancelled(&state);
    assert!(registry.is_cancelled(state.task_id));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn clear_removes_entry() {
    let registry = CancellationRegistry::new();
    let state = EntryState::new();
    registry.mark_cancelled(&state);
    registry.clear(state.task_id);
    assert!(!registry.is_cancelled(state.task_id));
    assert_eq!(registry.len(), 0);
    // Clearing an absent id is harmless.
    registry.clear(state.task_id);
  }

  #[test]
  fn mark_after_settlement_does_not_leak() {
    let registry = CancellationRegistry::new();
    let state = EntryState::new();
    assert!(state.settle());
    registry.clear(state.task_id);
    registry.mark_cancelled(&state);
    assert_eq!(registry.len(), 0);
  }

  #[test]
  fn concurrent_marks_and_clears_leave_registry_empty() {
    use std::sync::Arc;
    use std::thread;

    let registry = Arc::new(CancellationRegistry::new());
    let states: Vec<_> = (0..64).map(|_| EntryState::new()).collect();

    let withdrawers: Vec<_> = states
      .iter()
      .cloned()
      .map(|state| {
        let registry = registry.clone();
        thread::spawn(move || registry.mark_cancelled(&state))
      })
      .collect();
    let settlers: Vec<_> = states
      .iter()
      .cloned()
      .map(|state| {
        let registry = registry.clone();
        thread::spawn(move || {
          if state.settle() {
            registry.clear(state.task_id);
          }
        })
      })
      .collect();

    for handle in withdrawers.into_iter().chain(settlers) {
      handle.join().unwrap();
    }
    assert_eq!(registry.len(), 0);
  }
}
