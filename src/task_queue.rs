use crate::error::SchedulerError;
use crate::task::TaskEntry;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unbounded, multi-producer, single-consumer ingress queue of task entries.
///
/// Submission never waits for capacity: backpressure is applied at admission
/// time by the scheduler's slots, not here.
#[derive(Debug)]
pub(crate) struct TaskQueue<R: Send + 'static> {
  tx: AsyncSender<TaskEntry<R>>,
  rx: AsyncReceiver<TaskEntry<R>>,
}

impl<R: Send + 'static> TaskQueue<R> {
  pub(crate) fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<R>, QueueConsumer<R>) {
    let producer = QueueProducer {
      tx: self.tx,
      closed: Arc::new(AtomicBool::new(false)),
    };
    (producer, QueueConsumer { rx: self.rx })
  }
}

/// The producer handle for the `TaskQueue`. Cloned into every submission site.
#[derive(Clone)]
pub(crate) struct QueueProducer<R: Send + 'static> {
  tx: AsyncSender<TaskEntry<R>>,
  // The channel's own `is_closed` reports a dropped receiver, not a closed sender.
  closed: Arc<AtomicBool>,
}

/// The consumer handle for the `TaskQueue`. Not cloneable: only the admission loop reads it.
#[derive(Debug)]
pub(crate) struct QueueConsumer<R: Send + 'static> {
  rx: AsyncReceiver<TaskEntry<R>>,
}

impl<R: Send + 'static> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueProducer<R> {
  /// Appends an entry to the queue. Does not deduplicate.
  pub(crate) async fn send(&self, entry: TaskEntry<R>) -> Result<(), SchedulerError> {
    if self.is_closed() {
      return Err(SchedulerError::SchedulerShuttingDown);
    }
    self
      .tx
      .send(entry)
      .await
      .map_err(|_| SchedulerError::QueueSendChannelClosed)
  }

  /// Closes the sending side of the queue. Later sends fail with `SchedulerShuttingDown`.
  pub(crate) fn close(&self) {
    self.closed.store(true, Ordering::Release);
    let _ = self.tx.close();
  }

  /// True once ingress was closed, or once the consumer is gone.
  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire) || self.tx.is_closed()
  }

  /// Returns the number of entries waiting in the queue.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

impl<R: Send + 'static> QueueConsumer<R> {
  /// Receives the next entry in submission order.
  /// Fails once the producer side is closed and every queued entry was received.
  pub(crate) async fn recv(&self) -> Result<TaskEntry<R>, RecvError> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::{EntryState, TaskToExecute};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn dummy_entry() -> TaskEntry<String> {
    TaskEntry {
      state: EntryState::new(),
      factory: Box::new(|| -> TaskToExecute<String> { Box::pin(async { "done".to_string() }) }),
      on_complete: Box::new(|_| {}),
    }
  }

  #[tokio::test]
  async fn test_queue_send_recv_preserves_order() {
    let (producer, consumer) = TaskQueue::<String>::new().split();

    let first = dummy_entry();
    let second = dummy_entry();
    let (first_id, second_id) = (first.task_id(), second.task_id());

    producer.send(first).await.unwrap();
    producer.send(second).await.unwrap();
    assert_eq!(producer.len(), 2);

    assert_eq!(consumer.recv().await.unwrap().task_id(), first_id);
    assert_eq!(consumer.recv().await.unwrap().task_id(), second_id);
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_queue_never_rejects_bursts() {
    let (producer, consumer) = TaskQueue::<String>::new().split();
    for _ in 0..1_000 {
      producer.send(dummy_entry()).await.unwrap();
    }
    assert_eq!(producer.len(), 1_000);
    for _ in 0..1_000 {
      consumer.recv().await.unwrap();
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_concurrent_sends() {
    let (producer, consumer) = TaskQueue::<String>::new().split();
    let num_entries = 20usize;
    let received_count = Arc::new(AtomicUsize::new(0));

    let mut senders = Vec::new();
    for _ in 0..num_entries {
      let p = producer.clone();
      senders.push(tokio::spawn(async move {
        p.send(dummy_entry()).await.unwrap();
      }));
    }

    let consumer_handle = {
      let received_count = received_count.clone();
      tokio::spawn(async move {
        for _ in 0..num_entries {
          if consumer.recv().await.is_ok() {
            received_count.fetch_add(1, Ordering::SeqCst);
          }
        }
      })
    };

    for sender in senders {
      sender.await.unwrap();
    }
    consumer_handle.await.unwrap();
    assert_eq!(received_count.load(Ordering::SeqCst), num_entries);
  }

  #[tokio::test]
  async fn test_close_sender_stops_consumer() {
    let (producer, consumer) = TaskQueue::<String>::new().split();

    let entry = dummy_entry();
    let id = entry.task_id();
    producer.send(entry).await.unwrap();
    assert!(!producer.is_closed());
    producer.close();
    assert!(producer.is_closed());
    assert!(producer.clone().is_closed());

    assert!(matches!(
      producer.send(dummy_entry()).await,
      Err(SchedulerError::SchedulerShuttingDown)
    ));
    assert_eq!(consumer.recv().await.unwrap().task_id(), id);
    assert!(matches!(consumer.recv().await, Err(RecvError::Disconnected)));
  }

  #[tokio::test]
  async fn test_close_is_idempotent() {
    let (producer, _consumer) = TaskQueue::<String>::new().split();
    producer.close();
    producer.close();
    assert!(producer.is_closed());
    assert!(matches!(
      producer.send(dummy_entry()).await,
      Err(SchedulerError::SchedulerShuttingDown)
    ));
  }
}
