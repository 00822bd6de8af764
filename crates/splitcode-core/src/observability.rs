//! Progress view of a task.
//!
//! Everything needed to tell why a task is stuck is on the task record
//! itself; this renders it in one flat, serializable shape.

use serde::{Deserialize, Serialize};

use crate::domain::{ConditionType, Phase, TranscodeTask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub name: String,
    pub task_id: String,
    pub phase: Phase,
    pub slices_planned: u32,
    pub slices_running: usize,
    pub slices_finished: usize,
    /// Conditions currently true, in the order they were first set.
    pub conditions: Vec<ConditionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&TranscodeTask> for TaskProgress {
    fn from(task: &TranscodeTask) -> Self {
        let status = &task.status;
        Self {
            name: task.metadata.name.clone(),
            task_id: task.task_id().to_string(),
            phase: Phase::of(status),
            slices_planned: status.slices_planned_count,
            slices_running: status.slices_scheduled.len(),
            slices_finished: status.slices_finished.len(),
            conditions: status
                .conditions
                .iter()
                .filter(|c| c.status)
                .map(|c| c.kind)
                .collect(),
            failure: status
                .conditions
                .get(ConditionType::Failed)
                .filter(|c| c.status)
                .map(|c| c.message.clone()),
        }
    }
}
