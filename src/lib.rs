//! A Tokio-based scheduler that runs caller-supplied async requests with bounded
//! concurrency, routes each result back to the caller that asked for it, and lets
//! callers withdraw requests that are still queued or already running.

mod config;
mod dispatcher;
mod error;
mod handle;
mod registry;
mod scheduler;
mod task;
mod task_queue;

pub use config::{SchedulerConfig, DEFAULT_MAX_CONCURRENT};
pub use dispatcher::{TaskCompletionInfo, TaskCompletionStatus};
pub use error::SchedulerError;
pub use handle::{RequestHandle, TaskHandle};
pub use scheduler::{Scheduler, ShutdownMode};
pub use task::{CompletionCallback, RequestFactory, TaskToExecute};
