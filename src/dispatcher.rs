use crate::error::SchedulerError;
use crate::registry::CancellationRegistry;
use crate::task::{CompletionCallback, EntryState};

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

// --- Public Event Structs for Handlers ---

/// How a request left the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  /// The operation resolved and its result was handed to the completion callback.
  Delivered,
  /// The operation panicked; the callback received `SchedulerError::TaskPanicked`.
  Panicked,
  /// Withdrawn while still queued. The factory was never invoked.
  CancelledBeforeStart,
  /// Withdrawn while running or awaiting delivery. The result was discarded.
  CancelledDuringFlight,
  /// Discarded by a scheduler shutdown before producing a result.
  Dropped,
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub scheduler_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub completion_time: SystemTime,
}

pub(crate) type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

// --- Internal Messages ---

pub(crate) enum DispatchMessage<R: Send + 'static> {
  /// An admitted entry whose operation resolved (or panicked).
  Deliver {
    state: Arc<EntryState>,
    on_complete: CompletionCallback<R>,
    outcome: Result<R, SchedulerError>,
  },
  /// An entry that was settled elsewhere without a delivery; only handlers hear about it.
  Settled { task_id: u64, status: TaskCompletionStatus },
}

impl<R: Send + 'static> fmt::Debug for DispatchMessage<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DispatchMessage::Deliver { state, outcome, .. } => f
        .debug_struct("Deliver")
        .field("task_id", &state.task_id)
        .field("is_ok", &outcome.is_ok())
        .finish_non_exhaustive(),
      DispatchMessage::Settled { task_id, status } => f
        .debug_struct("Settled")
        .field("task_id", task_id)
        .field("status", status)
        .finish(),
    }
  }
}

pub(crate) type DispatchSender<R> = AsyncSender<DispatchMessage<R>>;

pub(crate) fn dispatch_channel<R: Send + 'static>() -> (DispatchSender<R>, AsyncReceiver<DispatchMessage<R>>) {
  mpsc::unbounded_async()
}

// --- ResultDispatcher ---

/// Routes finished entries back to their callers, in the order they finish.
///
/// The worker loop runs until every sender (the admission loop and all
/// running executors) has been dropped, so results of operations still in
/// flight during a graceful shutdown are delivered.
pub(crate) struct ResultDispatcher {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  scheduler_name: Arc<String>,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ResultDispatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultDispatcher")
      .field("scheduler_name", &self.scheduler_name)
      .field("handler_count", &self.handlers.read().len())
      .field("worker_running", &self.worker_join_handle.lock().is_some())
      .finish()
  }
}

impl ResultDispatcher {
  pub(crate) fn spawn<R: Send + 'static>(
    rx: AsyncReceiver<DispatchMessage<R>>,
    registry: Arc<CancellationRegistry>,
    scheduler_name: Arc<String>,
    tokio_handle: &TokioHandle,
  ) -> Self {
    let handlers: Arc<RwLock<Vec<CompletionHandler>>> = Arc::new(RwLock::new(Vec::new()));

    let worker = DispatchWorker {
      handlers: handlers.clone(),
      registry,
      scheduler_name: scheduler_name.clone(),
    };
    let join_handle = tokio_handle.spawn(
      worker
        .run(rx)
        .instrument(info_span!("result_dispatcher_loop", scheduler = %*scheduler_name)),
    );

    Self {
      handlers,
      scheduler_name,
      worker_join_handle: Mutex::new(Some(join_handle)),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(scheduler = %*self.scheduler_name, "Dispatcher: Added completion handler. Total handlers: {}", handlers_guard.len());
  }

  pub(crate) async fn await_shutdown(&self) {
    let handle_option = self.worker_join_handle.lock().take();

    if let Some(handle) = handle_option {
      info!(scheduler = %*self.scheduler_name, "Dispatcher: Waiting for dispatch loop to drain and join.");
      if let Err(e) = handle.await {
        error!(scheduler = %*self.scheduler_name, "Dispatcher: Error joining dispatch loop: {:?}", e);
      } else {
        debug!(scheduler = %*self.scheduler_name, "Dispatcher: Dispatch loop joined.");
      }
    } else {
      trace!(scheduler = %*self.scheduler_name, "Dispatcher: Join handle already taken; no join needed.");
    }
  }
}

struct DispatchWorker {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  registry: Arc<CancellationRegistry>,
  scheduler_name: Arc<String>,
}

impl DispatchWorker {
  async fn run<R: Send + 'static>(self, rx: AsyncReceiver<DispatchMessage<R>>) {
    info!("Dispatch loop started.");
    loop {
      match rx.recv().await {
        Ok(message) => self.process(message),
        Err(_) => {
          info!("Dispatch loop: all senders dropped and queue drained. Terminating.");
          break;
        }
      }
    }
    info!(
      pending_cancellations = self.registry.len(),
      "Dispatch loop stopped."
    );
  }

  fn process<R: Send + 'static>(&self, message: DispatchMessage<R>) {
    trace!(?message, "Dispatch loop: processing message.");
    match message {
      DispatchMessage::Deliver {
        state,
        on_complete,
        outcome,
      } => {
        let task_id = state.task_id;

        if state.is_cancelled() || self.registry.is_cancelled(task_id) {
          if state.settle() {
            self.registry.clear(task_id);
            debug!(%task_id, "Result arrived for a withdrawn request; discarding.");
            self.notify(task_id, TaskCompletionStatus::CancelledDuringFlight);
          }
          return;
        }

        if !state.settle() {
          warn!(%task_id, "Result arrived for an already settled request; discarding.");
          return;
        }
        // A withdrawal racing with settlement may have inserted the id after our check.
        self.registry.clear(task_id);

        let status = match &outcome {
          Ok(_) => TaskCompletionStatus::Delivered,
          Err(SchedulerError::TaskPanicked) => TaskCompletionStatus::Panicked,
          Err(_) => TaskCompletionStatus::Dropped,
        };

        debug!(%task_id, ?status, "Delivering result to completion callback.");
        if catch_unwind(AssertUnwindSafe(move || on_complete(outcome))).is_err() {
          error!(%task_id, "Completion callback panicked.");
        }
        self.notify(task_id, status);
      }
      DispatchMessage::Settled { task_id, status } => self.notify(task_id, status),
    }
  }

  fn notify(&self, task_id: u64, status: TaskCompletionStatus) {
    // Handlers may register further handlers, so none of them runs under the lock.
    let handlers: Vec<CompletionHandler> = self.handlers.read().clone();
    if handlers.is_empty() {
      return;
    }

    let info = TaskCompletionInfo {
      task_id,
      scheduler_name: self.scheduler_name.clone(),
      status,
      completion_time: SystemTime::now(),
    };
    for handler in handlers.iter() {
      let info_for_handler = info.clone();
      if catch_unwind(AssertUnwindSafe(|| handler(info_for_handler))).is_err() {
        error!(
          "A completion handler panicked. Scheduler: {}, Task ID: {}",
          info.scheduler_name, info.task_id
        );
      }
    }
  }
}
