use crate::message::TaskMessage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No route for message: {0}")]
    Unroutable(String),
}

/// Publishes task messages to the broker.
///
/// A failed publish is reported to the caller as-is; the task engine does not
/// retry it (transport clients apply their own publish retry policy).
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn publish(&self, message: TaskMessage) -> Result<(), PublishError>;
}
