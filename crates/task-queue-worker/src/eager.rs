//! Run a task and every retry it schedules inside the current process.

use crate::dispatch::Dispatcher;
use crate::handler::TaskHandlerRegistry;
use crate::retry::RetryController;
use crate::revoked::RevocationRegistry;
use serde_json::Value;
use std::sync::Arc;
use task_queue_broker::MemoryTransport;
use task_queue_core::{
    Args, Enqueuer, JitterSource, Kwargs, MemoryBackend, Result, TaskError, TaskId, TaskMessage,
};
use tracing::debug;

#[derive(Debug)]
pub struct EagerResult {
    pub task_id: TaskId,
    /// Times the task body ran, retries included
    pub executions: u32,
    pub result: Result<Value>,
}

/// Executes tasks synchronously, ignoring countdowns between retries
pub struct EagerRunner {
    transport: MemoryTransport,
    backend: Arc<MemoryBackend>,
    dispatcher: Dispatcher,
}

impl EagerRunner {
    pub fn new(registry: TaskHandlerRegistry) -> Self {
        Self::build(registry, RetryController::new)
    }

    /// Runner whose retry delays come from `jitter`
    pub fn with_jitter(registry: TaskHandlerRegistry, jitter: Box<dyn JitterSource>) -> Self {
        Self::build(registry, |enqueuer| RetryController::new(enqueuer).with_jitter(jitter))
    }

    fn build(
        registry: TaskHandlerRegistry,
        controller: impl FnOnce(Arc<dyn Enqueuer>) -> RetryController,
    ) -> Self {
        let transport = MemoryTransport::new();
        let backend = Arc::new(MemoryBackend::new());
        let enqueuer: Arc<dyn Enqueuer> = Arc::new(transport.clone());
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(RevocationRegistry::default()),
            Arc::new(controller(enqueuer)),
            backend.clone(),
        );
        EagerRunner {
            transport,
            backend,
            dispatcher,
        }
    }

    pub async fn apply(&self, task: &str, args: Args, kwargs: Kwargs) -> Result<EagerResult> {
        let message = TaskMessage::builder(task).args(args).kwargs(kwargs).build();
        self.apply_message(message).await
    }

    pub async fn apply_message(&self, message: TaskMessage) -> Result<EagerResult> {
        let task_id = message.id.clone();
        self.transport.publish(message).await?;

        let mut executions = 0;
        while let Some(next) = self.transport.queue().pop_any() {
            executions += 1;
            debug!("Eager execution {} of {}[{}]", executions, next.task, next.id);

            let disposition = self.dispatcher.dispatch(next).await?;
            if disposition.is_terminal() {
                return Ok(EagerResult {
                    task_id,
                    executions,
                    result: disposition
                        .into_result()
                        .map(|value| value.unwrap_or(Value::Null)),
                });
            }
        }

        Err(TaskError::Other(format!(
            "Task {} left the queue without finishing",
            task_id
        )))
    }

    /// Every message published, including the initial one
    pub fn published(&self) -> Vec<TaskMessage> {
        self.transport.published()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    pub fn revoked(&self) -> &Arc<RevocationRegistry> {
        self.dispatcher.revoked()
    }
}
