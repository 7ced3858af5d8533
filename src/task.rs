use crate::error::SchedulerError;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// The type of future a request produces.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// Zero-argument function that produces the request's operation.
/// It is invoked at most once, and only if the request is admitted before being withdrawn.
pub type RequestFactory<R> = Box<dyn FnOnce() -> TaskToExecute<R> + Send + 'static>;

/// Callback receiving the outcome of an admitted, non-withdrawn request.
pub type CompletionCallback<R> = Box<dyn FnOnce(Result<R, SchedulerError>) + Send + 'static>;

/// State shared between a queued/running entry and the caller's handle.
#[derive(Debug)]
pub(crate) struct EntryState {
  pub(crate) task_id: u64,
  pub(crate) cancel_token: CancellationToken,
  withdrawn: AtomicBool,
  settled: AtomicBool,
}

impl EntryState {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      task_id: NEXT_TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
      cancel_token: CancellationToken::new(),
      withdrawn: AtomicBool::new(false),
      settled: AtomicBool::new(false),
    })
  }

  /// Records the withdrawal. Returns `false` if it had already been recorded.
  pub(crate) fn mark_withdrawn(&self) -> bool {
    !self.withdrawn.swap(true, Ordering::SeqCst)
  }

  /// Whether the caller withdrew this entry.
  pub(crate) fn is_withdrawn(&self) -> bool {
    self.withdrawn.load(Ordering::SeqCst)
  }

  /// Whether the entry's result must not be delivered, by withdrawal or forced shutdown.
  pub(crate) fn is_cancelled(&self) -> bool {
    self.is_withdrawn() || self.cancel_token.is_cancelled()
  }

  /// Claims the single right to finish this entry.
  /// Returns `true` for exactly one caller over the entry's lifetime.
  pub(crate) fn settle(&self) -> bool {
    !self.settled.swap(true, Ordering::SeqCst)
  }

  pub(crate) fn is_settled(&self) -> bool {
    self.settled.load(Ordering::SeqCst)
  }
}

/// One caller's request: the operation factory, where its result goes, and its shared state.
pub(crate) struct TaskEntry<R: Send + 'static> {
  pub(crate) state: Arc<EntryState>,
  pub(crate) factory: RequestFactory<R>,
  pub(crate) on_complete: CompletionCallback<R>,
}

impl<R: Send + 'static> TaskEntry<R> {
  pub(crate) fn task_id(&self) -> u64 {
    self.state.task_id
  }
}

impl<R: Send + 'static> fmt::Debug for TaskEntry<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskEntry")
      .field("task_id", &self.state.task_id)
      .field("cancelled", &self.state.is_cancelled())
      .field("settled", &self.state.is_settled())
      .finish_non_exhaustive()
  }
}
