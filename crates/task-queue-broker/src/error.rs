use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to declare {entity}: {reason}")]
    Declare { entity: String, reason: String },

    #[error("Failed to bind {from} to {to}: {reason}")]
    Bind {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid countdown for delayed delivery: {0}")]
    InvalidCountdown(u64),

    #[error("Connection closed")]
    Closed,
}

impl BrokerError {
    /// Transient errors worth retrying with backoff
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
