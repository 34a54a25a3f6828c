use crate::exception::TaskException;
use crate::message::TaskMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Positional task arguments
pub type Args = Vec<Value>;

/// Keyword task arguments
pub type Kwargs = Map<String, Value>;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        TaskId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        TaskId(id)
    }
}

/// Task state as recorded in the result backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Published, not yet picked up
    Pending,
    /// Picked up by a worker
    Started,
    /// Failed and re-enqueued for another attempt
    Retry,
    /// Completed successfully
    Success,
    /// Terminal failure
    Failure,
    /// Skipped because its id was revoked
    Revoked,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Revoked => "REVOKED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskState::Pending),
            "STARTED" => Some(TaskState::Started),
            "RETRY" => Some(TaskState::Retry),
            "SUCCESS" => Some(TaskState::Success),
            "FAILURE" => Some(TaskState::Failure),
            "REVOKED" => Some(TaskState::Revoked),
            _ => None,
        }
    }

    /// No further attempts will follow
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }
}

/// One execution attempt of a task.
///
/// Built fresh from every delivered message; a retry produces a new message
/// and therefore a new attempt with `retries` incremented by one.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAttempt {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: Args,
    pub kwargs: Kwargs,
    /// Number of attempts made before this one
    pub retries: u32,
    /// `None` means retries are unbounded
    pub max_retries: Option<u32>,
    /// Exception carried over from the previous attempt, if any
    pub exception: Option<TaskException>,
}

impl TaskAttempt {
    /// Build an attempt from a delivered message. A max-retries override
    /// carried by the message wins over the task default.
    pub fn from_message(message: &TaskMessage, default_max_retries: Option<u32>) -> Self {
        TaskAttempt {
            task_id: message.id.clone(),
            task_name: message.task.clone(),
            args: message.args.clone(),
            kwargs: message.kwargs.clone(),
            retries: message.retries,
            max_retries: message.max_retries.or(default_max_retries),
            exception: message.exception.as_ref().map(|e| e.restore()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::TaskException;
    use serde_json::json;

    #[test]
    fn test_task_state_names() {
        for state in [
            TaskState::Pending,
            TaskState::Started,
            TaskState::Retry,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Revoked,
        ] {
            assert_eq!(TaskState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::from_str("bogus"), None);
        assert!(TaskState::Success.is_ready());
        assert!(!TaskState::Retry.is_ready());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn test_attempt_from_message() {
        let message = TaskMessage::builder("divide")
            .id("t-1")
            .args(vec![json!(1), json!(0)])
            .retries(2)
            .exception(&TaskException::new("arithmetic.zero_division", "division by zero"))
            .build();

        let attempt = TaskAttempt::from_message(&message, Some(3));
        assert_eq!(attempt.task_id, TaskId::from("t-1"));
        assert_eq!(attempt.retries, 2);
        assert_eq!(attempt.max_retries, Some(3));
        assert_eq!(
            attempt.exception.unwrap().message,
            "division by zero"
        );
    }

    #[test]
    fn test_message_max_retries_override() {
        let message = TaskMessage::builder("divide").max_retries(10).build();
        let attempt = TaskAttempt::from_message(&message, Some(3));
        assert_eq!(attempt.max_retries, Some(10));
    }
}
