//! In-process transport used by the worker binary and the test-suite.

use crate::connection::{BrokerConnection, Connection, Consumer};
use crate::entity::{ExchangeSpec, QueueSpec};
use crate::error::{BrokerError, Result};
use crate::queue::MessageQueue;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use task_queue_core::{Enqueuer, PublishError, TaskMessage};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Exchange {
        destination: String,
        source: String,
        routing_key: String,
    },
    Queue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

/// Everything declared through connections of a transport
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub exchanges: BTreeMap<String, ExchangeSpec>,
    pub queues: BTreeMap<String, QueueSpec>,
    pub bindings: Vec<Binding>,
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<String>,
    fail_declare: bool,
    fail_bind: HashSet<String>,
}

struct Inner {
    queue: MessageQueue,
    published: Mutex<Vec<TaskMessage>>,
    topology: RwLock<Topology>,
    faults: RwLock<Faults>,
    connect_attempts: Mutex<HashMap<String, usize>>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            inner: Arc::new(Inner {
                queue: MessageQueue::new(),
                published: Mutex::new(Vec::new()),
                topology: RwLock::new(Topology::default()),
                faults: RwLock::new(Faults::default()),
                connect_attempts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Refuse every connection to `url`
    pub fn set_unreachable(&self, url: impl Into<String>) {
        self.inner.faults.write().unreachable.insert(url.into());
    }

    /// Make every declaration fail
    pub fn fail_declarations(&self, fail: bool) {
        self.inner.faults.write().fail_declare = fail;
    }

    /// Make binding `queue` to any exchange fail
    pub fn fail_bind(&self, queue: impl Into<String>) {
        self.inner.faults.write().fail_bind.insert(queue.into());
    }

    pub fn connect_attempts(&self, url: &str) -> usize {
        self.inner
            .connect_attempts
            .lock()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn topology(&self) -> Topology {
        self.inner.topology.read().clone()
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<TaskMessage> {
        self.inner.published.lock().clone()
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.inner.queue
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnection for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        *self
            .inner
            .connect_attempts
            .lock()
            .entry(url.to_string())
            .or_insert(0) += 1;

        if self.inner.faults.read().unreachable.contains(url) {
            return Err(BrokerError::Connection(format!(
                "[Errno 111] Connection refused: {}",
                url
            )));
        }

        debug!("Connected to {}", url);
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

#[async_trait]
impl Enqueuer for MemoryTransport {
    async fn publish(&self, message: TaskMessage) -> std::result::Result<(), PublishError> {
        debug!("Publishing {}[{}]", message.task, message.id);
        self.inner.published.lock().push(message.clone());
        self.inner.queue.push(message);
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryTransport {
    async fn fetch(&self) -> Result<Option<TaskMessage>> {
        Ok(self.inner.queue.pop_ready(Utc::now()))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
}

impl MemoryConnection {
    fn check_declare(&self, entity: &str) -> Result<()> {
        if self.inner.faults.read().fail_declare {
            return Err(BrokerError::Declare {
                entity: entity.to_string(),
                reason: "PRECONDITION_FAILED - inequivalent arg".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.check_declare(&exchange.name)?;
        self.inner
            .topology
            .write()
            .exchanges
            .insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.check_declare(&queue.name)?;
        self.inner
            .topology
            .write()
            .queues
            .insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.inner.topology.write().bindings.push(Binding::Exchange {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if self.inner.faults.read().fail_bind.contains(queue) {
            return Err(BrokerError::Bind {
                from: exchange.to_string(),
                to: queue.to_string(),
                reason: "NOT_FOUND - no queue".to_string(),
            });
        }
        self.inner.topology.write().bindings.push(Binding::Queue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }
}
