use crate::backend::BackendError;
use crate::enqueue::PublishError;
use crate::exception::TaskException;
use crate::task::{Args, Kwargs, TaskId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Message size exceeds maximum allowed size of {max} bytes (got {actual})")]
    MessageTooLarge { max: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Task not registered: {0}")]
    NotRegistered(String),

    #[error("Task failed: {0}")]
    Failed(TaskException),

    #[error("Can't retry {task_name}[{task_id}] args:{task_args:?} kwargs:{task_kwargs:?}")]
    MaxRetriesExceeded {
        task_name: String,
        task_id: TaskId,
        task_args: Args,
        task_kwargs: Kwargs,
        /// Error of the final attempt, if one was raised
        cause: Option<TaskException>,
    },

    #[error("Retry in {countdown}s")]
    Retry {
        task_id: TaskId,
        countdown: u64,
        exception: Option<TaskException>,
    },

    #[error("Countdown of {0}s is out of range")]
    InvalidCountdown(u64),

    #[error("Task revoked: {0}")]
    Revoked(TaskId),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Result backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Other error: {0}")]
    Other(String),
}

impl TaskError {
    /// The task-level exception behind this error, if any
    pub fn exception(&self) -> Option<&TaskException> {
        match self {
            TaskError::Failed(exc) => Some(exc),
            TaskError::MaxRetriesExceeded { cause, .. } => cause.as_ref(),
            TaskError::Retry { exception, .. } => exception.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
