use crate::exception::{TaskException, WireException};
use crate::priority::Priority;
use crate::task::{Args, Kwargs, TaskId};
use crate::{Result, TaskError, MAX_MESSAGE_SIZE};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Message published to the broker for one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task identifier, stable across retries
    pub id: TaskId,

    /// Registered task name (e.g., "send_email")
    pub task: String,

    pub args: Args,

    pub kwargs: Kwargs,

    /// Attempts made before the one this message requests
    pub retries: u32,

    /// Earliest time the task may run
    pub eta: Option<DateTime<Utc>>,

    /// Countdown in seconds the ETA was computed from, if any
    pub countdown: Option<u64>,

    /// Application routing key, kept unchanged across retries
    pub routing_key: Option<String>,

    pub priority: Option<Priority>,

    /// Broker destination overriding the application routing, if any
    pub delivery: Option<DeliveryInfo>,

    /// Max retries override requested at the retry call site
    pub max_retries: Option<u32>,

    /// Exception that caused this message to be a retry
    pub exception: Option<WireException>,
}

/// Exchange and routing key a message is actually published to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
}

impl TaskMessage {
    pub fn builder(task: impl Into<String>) -> TaskMessageBuilder {
        TaskMessageBuilder::new(task.into())
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(TaskError::MessageTooLarge {
                max: MAX_MESSAGE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TaskError::from)
    }

    /// When the message becomes eligible for execution
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        self.eta
    }

    /// Check if the ETA (if any) has passed
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.eta.map_or(true, |eta| eta <= now)
    }
}

/// Builder for task messages
pub struct TaskMessageBuilder {
    message: TaskMessage,
}

impl TaskMessageBuilder {
    pub fn new(task: String) -> Self {
        TaskMessageBuilder {
            message: TaskMessage {
                id: TaskId::generate(),
                task,
                args: Args::new(),
                kwargs: Kwargs::new(),
                retries: 0,
                eta: None,
                countdown: None,
                routing_key: None,
                priority: None,
                delivery: None,
                max_retries: None,
                exception: None,
            },
        }
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.message.id = id.into();
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.message.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.message.kwargs = kwargs;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.message.retries = retries;
        self
    }

    /// Set the ETA to `now + countdown` seconds.
    ///
    /// Fails with [`TaskError::InvalidCountdown`] when the ETA is not
    /// representable.
    pub fn countdown(mut self, countdown: u64) -> Result<Self> {
        let eta = i64::try_from(countdown)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or(TaskError::InvalidCountdown(countdown))?;
        self.message.countdown = Some(countdown);
        self.message.eta = Some(eta);
        Ok(self)
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.message.eta = Some(eta);
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.message.routing_key = Some(routing_key.into());
        self
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.message.priority = Some(priority.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.message.max_retries = Some(max_retries);
        self
    }

    pub fn exception(mut self, exception: &TaskException) -> Self {
        self.message.exception = Some(exception.to_wire());
        self
    }

    pub fn build(self) -> TaskMessage {
        self.message
    }
}
