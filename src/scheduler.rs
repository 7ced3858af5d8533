use crate::config::SchedulerConfig;
use crate::dispatcher::{dispatch_channel, DispatchMessage, DispatchSender, ResultDispatcher, TaskCompletionInfo, TaskCompletionStatus};
use crate::error::SchedulerError;
use crate::handle::{RequestHandle, TaskHandle};
use crate::registry::CancellationRegistry;
use crate::task::{CompletionCallback, EntryState, TaskEntry, TaskToExecute};
use crate::task_queue::{QueueConsumer, QueueProducer, TaskQueue};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Defines how the scheduler should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for running operations to complete and deliver their results.
  /// Queued requests that haven't been admitted are dropped.
  Graceful,
  /// Aborts all running operations without delivering their results.
  /// Queued requests that haven't been admitted are dropped.
  ForcefulCancel,
}

/// Admits at most `max_concurrent` requests at a time and routes each result back to its caller.
///
/// Requests are admitted in submission order as slots free up; results are
/// delivered in the order operations finish. A request can be withdrawn at any
/// point before delivery, after which its completion callback is never invoked.
pub struct Scheduler<R: Send + 'static> {
  name: Arc<String>,
  max_concurrent: usize,
  producer: QueueProducer<R>,
  registry: Arc<CancellationRegistry>,
  active_tasks: Arc<DashSet<u64>>,
  dispatcher: ResultDispatcher,
  shutdown_token: CancellationToken,
  force_cancel_token: CancellationToken,
  shutdown_claimed: AtomicBool,
  shutdown_complete: CancellationToken,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + 'static> Scheduler<R> {
  /// Creates a scheduler and spawns its admission and dispatch loops on `tokio_handle`.
  pub fn new(config: SchedulerConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    let name = Arc::new(config.name.clone());
    let max_concurrent = config.effective_max_concurrent();
    let (producer, consumer) = TaskQueue::new().split();
    let registry = Arc::new(CancellationRegistry::new());
    let active_tasks = Arc::new(DashSet::new());
    let shutdown_token = CancellationToken::new();
    let force_cancel_token = CancellationToken::new();

    let (dispatch_tx, dispatch_rx) = dispatch_channel();
    let dispatcher = ResultDispatcher::spawn(dispatch_rx, registry.clone(), name.clone(), &tokio_handle);

    let admission = AdmissionLoop {
      name: name.clone(),
      semaphore: Arc::new(Semaphore::new(max_concurrent)),
      consumer,
      registry: registry.clone(),
      active_tasks: active_tasks.clone(),
      dispatch_tx,
      tokio_handle: tokio_handle.clone(),
      shutdown_token: shutdown_token.clone(),
      force_cancel_token: force_cancel_token.clone(),
    };
    let worker_join_handle = tokio_handle.spawn(
      admission
        .run()
        .instrument(info_span!("scheduler_admission_loop", scheduler = %*name)),
    );

    info!(scheduler = %*name, %max_concurrent, "Scheduler created.");

    Arc::new(Self {
      name,
      max_concurrent,
      producer,
      registry,
      active_tasks,
      dispatcher,
      shutdown_token,
      force_cancel_token,
      shutdown_claimed: AtomicBool::new(false),
      shutdown_complete: CancellationToken::new(),
      worker_join_handle: Mutex::new(Some(worker_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_concurrent
  }

  /// Returns the number of operations currently in flight.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  /// Returns the current number of requests waiting for a free slot.
  pub fn queued_task_count(&self) -> usize {
    self.producer.len()
  }

  /// Returns the number of withdrawals not yet observed by the scheduler.
  /// Zero whenever the scheduler is quiescent.
  pub fn pending_cancellations(&self) -> usize {
    self.registry.len()
  }

  /// Registers a handler notified once for every request that leaves the scheduler,
  /// including skipped and discarded ones.
  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.dispatcher.add_handler(handler);
  }

  /// Submits a request whose result is awaited through the returned handle.
  pub async fn enqueue<F, Fut>(&self, request_factory: F) -> Result<TaskHandle<R>, SchedulerError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    let (result_tx, result_rx) = oneshot::channel::<Result<R, SchedulerError>>();
    let on_complete: CompletionCallback<R> = Box::new(move |outcome| {
      // The receiver may already be gone; the caller then simply isn't listening.
      let _ = result_tx.send(outcome);
    });
    let request = self.submit(request_factory, on_complete).await?;
    Ok(TaskHandle {
      request,
      result_receiver: result_rx,
    })
  }

  /// Submits a request whose result is handed to `on_complete`.
  ///
  /// `on_complete` runs at most once, on the dispatch loop, and never for a withdrawn request.
  pub async fn enqueue_with_callback<F, Fut, C>(
    &self,
    request_factory: F,
    on_complete: C,
  ) -> Result<RequestHandle, SchedulerError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
    C: FnOnce(Result<R, SchedulerError>) + Send + 'static,
  {
    self.submit(request_factory, Box::new(on_complete)).await
  }

  /// Withdraws a previously enqueued request. See [`RequestHandle::withdraw`].
  pub fn withdraw(&self, handle: &impl AsRef<RequestHandle>) {
    handle.as_ref().withdraw();
  }

  async fn submit<F, Fut>(
    &self,
    request_factory: F,
    on_complete: CompletionCallback<R>,
  ) -> Result<RequestHandle, SchedulerError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
  {
    if self.shutdown_token.is_cancelled() || self.producer.is_closed() {
      warn!(scheduler = %self.name, "Enqueue: Attempted to submit a request to a scheduler that is shutting down.");
      return Err(SchedulerError::SchedulerShuttingDown);
    }

    let state = EntryState::new();
    let task_id = state.task_id;
    let entry = TaskEntry {
      state: state.clone(),
      factory: Box::new(move || -> TaskToExecute<R> { Box::pin(request_factory()) }),
      on_complete,
    };

    debug!(scheduler = %self.name, %task_id, "Submitting request to queue.");
    match self.producer.send(entry).await {
      Ok(()) => Ok(RequestHandle {
        state,
        registry: self.registry.clone(),
      }),
      Err(send_error) => {
        error!(scheduler = %self.name, %task_id, "Enqueue: Failed to send request to queue: {}", send_error);
        if self.shutdown_token.is_cancelled() || self.producer.is_closed() {
          Err(SchedulerError::SchedulerShuttingDown)
        } else {
          Err(send_error)
        }
      }
    }
  }

  /// Stops admission and waits until the admission and dispatch loops have finished.
  ///
  /// A call made while another shutdown is in progress waits for that shutdown
  /// to complete; its `mode` is ignored.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), SchedulerError> {
    if self.shutdown_claimed.swap(true, Ordering::AcqRel) {
      info!(scheduler = %self.name, "Shutdown already in progress; waiting for it to complete.");
      self.shutdown_complete.cancelled().await;
      return Ok(());
    }

    // Released on return, or if this call is dropped midway, so waiting callers never hang.
    let _completion = self.shutdown_complete.clone().drop_guard();
    info!(scheduler = %self.name, "Initiating explicit scheduler shutdown (mode: {:?}).", mode);
    self.shutdown_token.cancel();
    self.producer.close();

    if mode == ShutdownMode::ForcefulCancel {
      info!(
        scheduler = %self.name,
        "Forceful shutdown: Aborting {} running operations.",
        self.active_tasks.len()
      );
      self.force_cancel_token.cancel();
    } else {
      info!(scheduler = %self.name, "Graceful shutdown: Allowing running operations to complete.");
    }

    let handle_to_await = self.worker_join_handle.lock().take();
    if let Some(handle) = handle_to_await {
      info!(scheduler = %self.name, "Waiting for admission loop to join.");
      if let Err(join_error) = handle.await {
        error!(scheduler = %self.name, "Error joining admission loop during shutdown: {:?}", join_error);
      }
    } else {
      trace!(scheduler = %self.name, "Admission loop join handle already taken.");
    }

    self.dispatcher.await_shutdown().await;

    info!(
      scheduler = %self.name,
      pending_cancellations = self.registry.len(),
      "Scheduler shutdown process completed by this call."
    );
    Ok(())
  }
}

impl<R: Send + 'static> Drop for Scheduler<R> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        scheduler = %*self.name,
        "Scheduler dropped. Initiating implicit graceful shutdown (stopping admission, closing queue)."
      );
      self.shutdown_token.cancel();
      self.producer.close();
    } else {
      trace!(scheduler = %*self.name, "Drop: Shutdown already in progress or completed.");
    }
  }
}

/// Drains the queue into free slots. Owns the only long-lived dispatch sender.
struct AdmissionLoop<R: Send + 'static> {
  name: Arc<String>,
  semaphore: Arc<Semaphore>,
  consumer: QueueConsumer<R>,
  registry: Arc<CancellationRegistry>,
  active_tasks: Arc<DashSet<u64>>,
  dispatch_tx: DispatchSender<R>,
  tokio_handle: TokioHandle,
  shutdown_token: CancellationToken,
  force_cancel_token: CancellationToken,
}

impl<R: Send + 'static> AdmissionLoop<R> {
  async fn run(self) {
    info!("Admission loop started.");

    loop {
      tokio::select! {
        biased;

        _ = self.shutdown_token.cancelled() => {
          info!("Shutdown signal received. Admission loop terminating.");
          break;
        }

        permit_acquisition_result = self.semaphore.clone().acquire_owned() => {
          let permit = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!("Semaphore closed. Admission loop exiting.");
              break;
            }
          };
          trace!("Acquired slot. Available: {}", self.semaphore.available_permits());

          let entry = tokio::select! {
            biased;
            _ = self.shutdown_token.cancelled() => {
              info!("Shutdown signal received while holding a free slot. Releasing it.");
              break;
            }
            recv_result = self.consumer.recv() => {
              match recv_result {
                Ok(entry) => entry,
                Err(_) => {
                  info!("Request queue closed and empty. Admission loop terminating.");
                  break;
                }
              }
            }
          };

          self.admit(entry, permit).await;
        }
      }
    }

    self.drain_queue().await;
    info!(
      active = self.active_tasks.len(),
      "Admission loop stopped."
    );
  }

  async fn admit(&self, entry: TaskEntry<R>, permit: OwnedSemaphorePermit) {
    let task_id = entry.task_id();

    if entry.state.is_cancelled() || self.registry.is_cancelled(task_id) {
      debug!(%task_id, "Dequeued request was withdrawn before admission; skipping.");
      drop(permit);
      if entry.state.settle() {
        self.registry.clear(task_id);
      }
      drop(entry);
      self
        .notify_settled(task_id, TaskCompletionStatus::CancelledBeforeStart)
        .await;
      return;
    }

    self.active_tasks.insert(task_id);
    debug!(%task_id, "Admitting request into a slot.");

    let executor = Executor {
      registry: self.registry.clone(),
      active_tasks: self.active_tasks.clone(),
      dispatch_tx: self.dispatch_tx.clone(),
      force_cancel_token: self.force_cancel_token.clone(),
    };
    self.tokio_handle.spawn(
      executor
        .run(entry, permit)
        .instrument(info_span!("scheduled_request", scheduler = %*self.name, %task_id)),
    );
  }

  /// Drops every request still queued at shutdown so none of them stays registered.
  async fn drain_queue(&self) {
    let mut dropped = 0usize;
    while let Ok(entry) = self.consumer.recv().await {
      let task_id = entry.task_id();
      let status = if entry.state.is_withdrawn() {
        TaskCompletionStatus::CancelledBeforeStart
      } else {
        TaskCompletionStatus::Dropped
      };
      if entry.state.settle() {
        self.registry.clear(task_id);
      }
      drop(entry);
      self.notify_settled(task_id, status).await;
      dropped += 1;
    }
    if dropped > 0 {
      info!(dropped, "Dropped queued requests that were never admitted.");
    }
  }

  async fn notify_settled(&self, task_id: u64, status: TaskCompletionStatus) {
    if self
      .dispatch_tx
      .send(DispatchMessage::Settled { task_id, status })
      .await
      .is_err()
    {
      trace!(%task_id, "Dispatch loop gone; settlement notice dropped.");
    }
  }
}

/// Runs one admitted request inside its slot.
struct Executor<R: Send + 'static> {
  registry: Arc<CancellationRegistry>,
  active_tasks: Arc<DashSet<u64>>,
  dispatch_tx: DispatchSender<R>,
  force_cancel_token: CancellationToken,
}

impl<R: Send + 'static> Executor<R> {
  async fn run(self, entry: TaskEntry<R>, permit: OwnedSemaphorePermit) {
    let _slot = permit;
    let TaskEntry {
      state,
      factory,
      on_complete,
    } = entry;
    let task_id = state.task_id;

    // The factory runs inside the race, so a withdrawal that lands before the
    // first poll means it is never invoked.
    let operation = AssertUnwindSafe(async move { factory().await }).catch_unwind();

    let outcome: Option<Result<R, SchedulerError>> = tokio::select! {
      biased;
      _ = state.cancel_token.cancelled() => {
        debug!("Request withdrawn while in flight; aborting operation.");
        None
      }
      _ = self.force_cancel_token.cancelled() => {
        debug!("Forceful shutdown; aborting operation.");
        None
      }
      operation_result = operation => {
        match operation_result {
          Ok(result) => {
            trace!("Operation resolved.");
            Some(Ok(result))
          }
          Err(_panic_payload) => {
            error!("Operation panicked during execution.");
            Some(Err(SchedulerError::TaskPanicked))
          }
        }
      }
    };

    self.active_tasks.remove(&task_id);

    let message = match outcome {
      Some(outcome) => DispatchMessage::Deliver {
        state,
        on_complete,
        outcome,
      },
      None => {
        let status = if state.is_withdrawn() {
          TaskCompletionStatus::CancelledDuringFlight
        } else {
          TaskCompletionStatus::Dropped
        };
        if state.settle() {
          self.registry.clear(task_id);
        }
        drop(on_complete);
        DispatchMessage::Settled { task_id, status }
      }
    };

    if self.dispatch_tx.send(message).await.is_err() {
      warn!("Dispatch loop gone; outcome of request lost.");
    }
  }
}
