use crate::entity::{ExchangeSpec, QueueSpec};
use crate::error::Result;
use async_trait::async_trait;
use task_queue_core::TaskMessage;

/// An open channel to the broker, used to declare topology
#[async_trait]
pub trait Connection: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Route messages matching `routing_key` from exchange `source` to exchange `destination`
    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()>;

    /// Route messages matching `routing_key` from `exchange` into `queue`
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens connections to a broker URL
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// Source of task messages for a worker
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Next deliverable message, `None` when nothing is ready
    async fn fetch(&self) -> Result<Option<TaskMessage>>;
}

/// Transport driver named by a broker URL's scheme
pub fn driver_type(url: &str) -> &str {
    let scheme = url.split("://").next().unwrap_or("");
    match scheme {
        "amqp" | "amqps" | "pyamqp" => "amqp",
        other => other,
    }
}
