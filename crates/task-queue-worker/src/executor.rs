use crate::handler::{AttemptContext, Outcome, TaskHandler};
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{Args, Kwargs, TaskException};
use tokio::time::timeout;
use tracing::{debug, error};

pub const TIMEOUT_KIND: &str = "worker.timeout";
pub const PANIC_KIND: &str = "worker.panic";
pub const CANCELLED_KIND: &str = "worker.cancelled";

/// Task executor with timeout support and panic recovery
pub struct TaskExecutor {
    handler: Arc<dyn TaskHandler>,
}

impl TaskExecutor {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        TaskExecutor { handler }
    }

    /// Run the handler once. `time_limit` of `None` lets it run forever.
    pub async fn execute(
        &self,
        ctx: &AttemptContext,
        args: &Args,
        kwargs: &Kwargs,
        time_limit: Option<Duration>,
    ) -> Outcome {
        let handler = Arc::clone(&self.handler);
        let (task_ctx, args, kwargs) = (ctx.clone(), args.clone(), kwargs.clone());

        let mut handle =
            tokio::spawn(async move { handler.run(&task_ctx, &args, &kwargs).await });

        let joined = match time_limit {
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    error!("Task {}[{}] timed out after {:?}", ctx.task_name, ctx.task_id, limit);
                    return Outcome::Failure(TaskException::new(
                        TIMEOUT_KIND,
                        format!("Task execution timed out after {:?}", limit),
                    ));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(outcome) => {
                debug!("Task {}[{}] finished", ctx.task_name, ctx.task_id);
                outcome
            }
            Err(e) if e.is_panic() => {
                error!("Task {}[{}] panicked: {:?}", ctx.task_name, ctx.task_id, e);
                Outcome::Failure(TaskException::new(PANIC_KIND, "Task panicked during execution"))
            }
            Err(_) => {
                error!("Task {}[{}] was cancelled", ctx.task_name, ctx.task_id);
                Outcome::Failure(TaskException::new(CANCELLED_KIND, "Task was cancelled"))
            }
        }
    }
}
