use crate::executor::TaskExecutor;
use crate::handler::{AttemptContext, TaskHandlerRegistry};
use crate::retry::{Disposition, RetryController};
use crate::revoked::RevocationRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task_queue_core::{
    ResultBackend, Result, TaskAttempt, TaskError, TaskException, TaskId, TaskMessage, TaskMeta,
    TaskState,
};
use tracing::{debug, error, info};

pub const NOT_REGISTERED_KIND: &str = "worker.not_registered";
pub const MAX_RETRIES_EXCEEDED_KIND: &str = "worker.max_retries_exceeded";

/// Takes one delivered message through admission, execution and retry
/// decision, recording each state in the result backend.
pub struct Dispatcher {
    registry: Arc<TaskHandlerRegistry>,
    revoked: Arc<RevocationRegistry>,
    controller: Arc<RetryController>,
    backend: Arc<dyn ResultBackend>,
    purge_interval: Duration,
    last_purge: Mutex<Instant>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskHandlerRegistry>,
        revoked: Arc<RevocationRegistry>,
        controller: Arc<RetryController>,
        backend: Arc<dyn ResultBackend>,
    ) -> Self {
        Dispatcher {
            registry,
            revoked,
            controller,
            backend,
            purge_interval: Duration::from_secs(1),
            last_purge: Mutex::new(Instant::now()),
        }
    }

    pub fn with_purge_interval(mut self, purge_interval: Duration) -> Self {
        self.purge_interval = purge_interval;
        self
    }

    pub fn revoked(&self) -> &Arc<RevocationRegistry> {
        &self.revoked
    }

    pub async fn dispatch(&self, message: TaskMessage) -> Result<Disposition> {
        self.maybe_purge();

        if self.revoked.contains(&message.id) {
            info!(task_id = %message.id, "Discarding revoked task: {}[{}]", message.task, message.id);
            self.store(&message.id, TaskMeta::new(TaskState::Revoked, message.retries))
                .await;
            return Ok(Disposition::Revoked(message.id));
        }

        let task = match self.registry.get(&message.task) {
            Some(task) => task,
            None => {
                error!("Received unregistered task of type {}", message.task);
                let exc = TaskException::new(
                    NOT_REGISTERED_KIND,
                    format!("Task of kind '{}' is not registered", message.task),
                );
                self.store(
                    &message.id,
                    TaskMeta::new(TaskState::Failure, message.retries).with_exception(exc.to_wire()),
                )
                .await;
                return Ok(Disposition::Failed(TaskError::NotRegistered(message.task)));
            }
        };

        let attempt = TaskAttempt::from_message(&message, task.policy.max_retries);
        let ctx = AttemptContext::from_attempt(&attempt);
        self.store(&message.id, TaskMeta::new(TaskState::Started, message.retries))
            .await;

        debug!(task_id = %message.id, "Executing {}[{}] (retries: {})", message.task, message.id, message.retries);
        let time_limit = task.policy.time_limit.map(Duration::from_secs);
        let outcome = TaskExecutor::new(task.handler)
            .execute(&ctx, &attempt.args, &attempt.kwargs, time_limit)
            .await;

        let disposition = match self.controller.on_outcome(&message, &task.policy, outcome).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(task_id = %message.id, "Failed to settle {}[{}]: {}", message.task, message.id, e);
                self.store(
                    &message.id,
                    TaskMeta::new(TaskState::Failure, message.retries)
                        .with_exception(failure_exception(&e).to_wire()),
                )
                .await;
                return Err(e);
            }
        };
        self.record(&message, &disposition).await;

        Ok(disposition)
    }

    async fn record(&self, message: &TaskMessage, disposition: &Disposition) {
        let meta = match disposition {
            Disposition::Succeeded(value) => {
                TaskMeta::new(TaskState::Success, message.retries).with_result(value.clone())
            }
            Disposition::Retrying { exception, .. } => {
                let meta = TaskMeta::new(TaskState::Retry, message.retries);
                match exception {
                    Some(exc) => meta.with_exception(exc.to_wire()),
                    None => meta,
                }
            }
            Disposition::Failed(err) => TaskMeta::new(TaskState::Failure, message.retries)
                .with_exception(failure_exception(err).to_wire()),
            Disposition::Revoked(_) => TaskMeta::new(TaskState::Revoked, message.retries),
        };
        self.store(&message.id, meta).await;
    }

    async fn store(&self, task_id: &TaskId, meta: TaskMeta) {
        if let Err(e) = self.backend.store(task_id, meta).await {
            error!(task_id = %task_id, "Failed to store task state: {}", e);
        }
    }

    fn maybe_purge(&self) {
        let mut last_purge = self.last_purge.lock();
        if last_purge.elapsed() < self.purge_interval {
            return;
        }
        *last_purge = Instant::now();
        drop(last_purge);

        let removed = self.revoked.purge();
        if removed > 0 {
            debug!("Purged {} expired revoked ids", removed);
        }
    }
}

/// Exception recorded for a terminal failure
fn failure_exception(err: &TaskError) -> TaskException {
    match err {
        TaskError::Failed(exc) => exc.clone(),
        TaskError::MaxRetriesExceeded {
            task_args,
            task_kwargs,
            ..
        } => TaskException::new(MAX_RETRIES_EXCEEDED_KIND, err.to_string())
            .arg(task_args.clone())
            .arg(task_kwargs.clone()),
        TaskError::NotRegistered(name) => TaskException::new(NOT_REGISTERED_KIND, name.clone()),
        other => TaskException::new("worker.error", other.to_string()),
    }
}
