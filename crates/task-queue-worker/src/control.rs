use crate::revoked::RevocationRegistry;
use serde::{Deserialize, Serialize};
use task_queue_core::TaskId;
use tracing::info;

/// Remote-control command delivered to a running worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Revoke { task_ids: Vec<TaskId> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Continue,
    Shutdown,
}

impl ControlCommand {
    pub fn apply(self, revoked: &RevocationRegistry) -> ControlAction {
        match self {
            ControlCommand::Revoke { task_ids } => {
                if task_ids.is_empty() {
                    return ControlAction::Continue;
                }
                let ids: Vec<&str> = task_ids.iter().map(TaskId::as_str).collect();
                info!("Tasks flagged as revoked: {}", ids.join(", "));
                revoked.update(task_ids);
                ControlAction::Continue
            }
            ControlCommand::Shutdown => {
                info!("Received shutdown command");
                ControlAction::Shutdown
            }
        }
    }
}
