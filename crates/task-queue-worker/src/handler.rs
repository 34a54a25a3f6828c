use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use task_queue_core::{
    Args, Kwargs, PolicyOverrides, RetryPolicy, TaskAttempt, TaskError, TaskException, TaskId,
};

/// What a handler sees about the attempt it is running
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub retries: u32,
    pub max_retries: Option<u32>,
}

impl AttemptContext {
    pub fn from_attempt(attempt: &TaskAttempt) -> Self {
        AttemptContext {
            task_id: attempt.task_id.clone(),
            task_name: attempt.task_name.clone(),
            retries: attempt.retries,
            max_retries: attempt.max_retries,
        }
    }
}

/// A task body asking to be run again
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    pub exception: Option<TaskException>,
    /// Replacement positional arguments
    pub args: Option<Args>,
    /// Replacement (or, without `args`, additional) keyword arguments
    pub kwargs: Option<Kwargs>,
    pub countdown: Option<u64>,
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    /// Surface the retry to the caller as an error
    pub throw: bool,
}

impl Default for RetryRequest {
    fn default() -> Self {
        RetryRequest {
            exception: None,
            args: None,
            kwargs: None,
            countdown: None,
            eta: None,
            max_retries: None,
            throw: true,
        }
    }
}

impl RetryRequest {
    pub fn exception(mut self, exception: TaskException) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn countdown(mut self, countdown: u64) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn throw(mut self, throw: bool) -> Self {
        self.throw = throw;
        self
    }
}

/// Result of running a task body once
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Retry(RetryRequest),
    Failure(TaskException),
}

impl From<Result<Value, TaskException>> for Outcome {
    fn from(result: Result<Value, TaskException>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(exc) => Outcome::Failure(exc),
        }
    }
}

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &AttemptContext, args: &Args, kwargs: &Kwargs) -> Outcome;
}

/// Handler backed by a plain function or closure
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&AttemptContext, &Args, &Kwargs) -> Outcome + Send + Sync,
{
    async fn run(&self, ctx: &AttemptContext, args: &Args, kwargs: &Kwargs) -> Outcome {
        (self.0)(ctx, args, kwargs)
    }
}

/// A handler together with the policy it was registered with
#[derive(Clone)]
pub struct RegisteredTask {
    pub handler: Arc<dyn TaskHandler>,
    pub policy: RetryPolicy,
}

/// Registry of task handlers by task name
pub struct TaskHandlerRegistry {
    defaults: RetryPolicy,
    handlers: Arc<RwLock<HashMap<String, RegisteredTask>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::with_defaults(RetryPolicy::default())
    }

    /// Registry whose tasks inherit `defaults` for every unset policy field
    pub fn with_defaults(defaults: RetryPolicy) -> Self {
        TaskHandlerRegistry {
            defaults,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register<H: TaskHandler + 'static>(
        &self,
        name: impl Into<String>,
        handler: H,
        overrides: PolicyOverrides,
    ) {
        let policy = self.defaults.merge(&overrides);
        self.insert(name.into(), Arc::new(handler), policy);
    }

    /// Register `name` on top of the effective policy of the already
    /// registered task `base`.
    pub fn register_derived<H: TaskHandler + 'static>(
        &self,
        name: impl Into<String>,
        base: &str,
        handler: H,
        overrides: PolicyOverrides,
    ) -> Result<(), TaskError> {
        let base_policy = self
            .policy(base)
            .ok_or_else(|| TaskError::NotRegistered(base.to_string()))?;
        self.insert(name.into(), Arc::new(handler), base_policy.merge(&overrides));
        Ok(())
    }

    fn insert(&self, name: String, handler: Arc<dyn TaskHandler>, policy: RetryPolicy) {
        let mut handlers = self.handlers.write();
        handlers.insert(name, RegisteredTask { handler, policy });
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTask> {
        let handlers = self.handlers.read();
        handlers.get(name).cloned()
    }

    /// Effective policy of a registered task
    pub fn policy(&self, name: &str) -> Option<RetryPolicy> {
        let handlers = self.handlers.read();
        handlers.get(name).map(|t| t.policy.clone())
    }

    pub fn defaults(&self) -> &RetryPolicy {
        &self.defaults
    }

    pub fn has_handler(&self, name: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
