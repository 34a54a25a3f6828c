mod task;
mod message;
mod error;
mod priority;
pub mod exception;
pub mod policy;
pub mod backoff;
pub mod enqueue;
pub mod backend;

pub use task::{Args, Kwargs, TaskAttempt, TaskId, TaskState};
pub use message::{DeliveryInfo, TaskMessage, TaskMessageBuilder};
pub use priority::Priority;
pub use error::{TaskError, Result};
pub use exception::{ErrorKind, ExceptionArg, TaskException, WireException};
pub use policy::{
    Backoff, PolicyOverrides, RetryKwargs, RetryPolicy, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF_MAX_SECS, DEFAULT_RETRY_DELAY_SECS, DEFAULT_TIME_LIMIT_SECS,
};
pub use backoff::{
    compute_delay, exponential_backoff_interval, retry_over_time, Intervals, JitterSource,
    RetrySchedule, ThreadRngJitter,
};
pub use enqueue::{Enqueuer, PublishError};
pub use backend::{BackendError, MemoryBackend, ResultBackend, TaskMeta};

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
