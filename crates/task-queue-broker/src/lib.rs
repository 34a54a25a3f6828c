pub mod connection;
pub mod entity;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use connection::{driver_type, BrokerConnection, Connection, Consumer};
pub use entity::{ExchangeKind, ExchangeSpec, ParseQueueTypeError, QueueSpec, QueueType};
pub use error::{BrokerError, Result};
pub use memory::{Binding, MemoryTransport, Topology};
pub use publisher::DelayedDeliveryPublisher;
pub use queue::MessageQueue;
pub use topology::{
    bind_queue_to_delayed_delivery_exchange, calculate_routing_key,
    declare_delayed_delivery_topology, delayed_delivery_info, detect_quorum_queues, entry_exchange,
    BindOutcome,
};
