use crate::exception::WireException;
use crate::task::{TaskId, TaskState};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Latest recorded state of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub state: TaskState,
    pub result: Option<Value>,
    pub exception: Option<WireException>,
    pub retries: u32,
}

impl TaskMeta {
    pub fn new(state: TaskState, retries: u32) -> Self {
        TaskMeta {
            state,
            result: None,
            exception: None,
            retries,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_exception(mut self, exception: WireException) -> Self {
        self.exception = Some(exception);
        self
    }
}

/// Key/value store for task states and results
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn store(&self, task_id: &TaskId, meta: TaskMeta) -> Result<(), BackendError>;

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskMeta>, BackendError>;
}

/// Process-local backend, keeps only the latest state per task
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<TaskId, TaskMeta>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn store(&self, task_id: &TaskId, meta: TaskMeta) -> Result<(), BackendError> {
        // Round-trip through JSON so only transportable values are stored.
        let encoded = serde_json::to_vec(&meta)?;
        let meta: TaskMeta = serde_json::from_slice(&encoded)?;
        self.entries.write().insert(task_id.clone(), meta);
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskMeta>, BackendError> {
        Ok(self.entries.read().get(task_id).cloned())
    }
}
