use crate::error::SchedulerError;
use crate::registry::CancellationRegistry;
use crate::task::EntryState;

use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Withdrawal handle for a request submitted with a completion callback.
///
/// Dropping it does not withdraw the request; callers that lose interest must call
/// [`withdraw`](Self::withdraw).
#[derive(Clone)]
pub struct RequestHandle {
  pub(crate) state: Arc<EntryState>,
  pub(crate) registry: Arc<CancellationRegistry>,
}

impl fmt::Debug for RequestHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestHandle")
      .field("task_id", &self.state.task_id)
      .field("withdrawn", &self.state.is_withdrawn())
      .field("settled", &self.state.is_settled())
      .finish()
  }
}

impl RequestHandle {
  /// Returns the unique ID of this request.
  pub fn id(&self) -> u64 {
    self.state.task_id
  }

  /// Whether [`withdraw`](Self::withdraw) has been called.
  pub fn is_withdrawn(&self) -> bool {
    self.state.is_withdrawn()
  }

  /// Whether the request has left the scheduler (delivered, skipped, discarded or dropped).
  pub fn is_finished(&self) -> bool {
    self.state.is_settled()
  }

  /// Withdraws the request: a queued request is skipped without invoking its factory,
  /// a running one has its operation aborted, and no result is ever delivered.
  ///
  /// Idempotent, and a no-op once the result has been delivered.
  pub fn withdraw(&self) {
    let task_id = self.state.task_id;
    if self.state.is_settled() {
      tracing::trace!(%task_id, "RequestHandle: Withdraw after settlement, nothing to do.");
      return;
    }
    if !self.state.mark_withdrawn() {
      tracing::trace!(%task_id, "RequestHandle: Already withdrawn.");
      return;
    }
    tracing::debug!(%task_id, "RequestHandle: Withdrawal requested.");
    self.registry.mark_cancelled(&self.state);
    self.state.cancel_token.cancel();
  }
}

impl AsRef<RequestHandle> for RequestHandle {
  fn as_ref(&self) -> &RequestHandle {
    self
  }
}

/// A handle to a request whose result is awaited through [`await_result`](Self::await_result).
pub struct TaskHandle<R: Send + 'static> {
  pub(crate) request: RequestHandle,
  pub(crate) result_receiver: oneshot::Receiver<Result<R, SchedulerError>>,
}

impl<R: Send + 'static> fmt::Debug for TaskHandle<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("request", &self.request)
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> TaskHandle<R> {
  /// Returns the unique ID of this request.
  pub fn id(&self) -> u64 {
    self.request.id()
  }

  /// A cloneable withdrawal handle, e.g. for a timeout or teardown path.
  pub fn request_handle(&self) -> RequestHandle {
    self.request.clone()
  }

  pub fn is_withdrawn(&self) -> bool {
    self.request.is_withdrawn()
  }

  /// See [`RequestHandle::withdraw`].
  pub fn withdraw(&self) {
    self.request.withdraw();
  }

  /// Awaits the request's outcome.
  ///
  /// # Errors
  /// Returns `SchedulerError::TaskPanicked` if the operation panicked.
  /// Returns `SchedulerError::TaskWithdrawn` if the request was withdrawn before delivery.
  /// Returns `SchedulerError::TaskDropped` if the scheduler shut down before the request produced a result.
  pub async fn await_result(self) -> Result<R, SchedulerError> {
    match self.result_receiver.await {
      Ok(outcome) => outcome,
      Err(_) if self.request.is_withdrawn() => Err(SchedulerError::TaskWithdrawn),
      Err(recv_error) => {
        tracing::debug!(task_id = %self.request.id(), "Result channel closed without a result: {}", recv_error);
        Err(SchedulerError::TaskDropped)
      }
    }
  }
}

impl<R: Send + 'static> AsRef<RequestHandle> for TaskHandle<R> {
  fn as_ref(&self) -> &RequestHandle {
    &self.request
  }
}
