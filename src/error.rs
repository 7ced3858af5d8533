use thiserror::Error;

/// Errors that can occur within a `request_throttle` scheduler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
  #[error("Scheduler's internal request queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Request operation panicked")]
  TaskPanicked,

  #[error("Request was withdrawn by its caller")]
  TaskWithdrawn,

  #[error("Request was dropped before producing a result (scheduler shut down)")]
  TaskDropped,

  #[error("Scheduler is shutting down or already shut down, cannot accept new requests")]
  SchedulerShuttingDown,
}
