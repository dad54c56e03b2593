use crate::chain::TaskChain;
use crate::task::{TaskRef, TaskState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub name: String,
    pub state: TaskState,
    pub priority: i32,
    pub delay: Option<f64>,
    pub elapsed: f64,
    pub wake_time: Option<f64>,
    pub run_count: u64,
}

impl TaskSnapshot {
    pub fn capture(task: &TaskRef) -> Self {
        Self {
            id: task.id().as_u64(),
            name: task.name(),
            state: task.state(),
            priority: task.priority(),
            delay: task.delay(),
            elapsed: task.elapsed_time(),
            wake_time: task.wake_time(),
            run_count: task.run_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub name: String,
    pub frame_budget: Option<f64>,
    pub passes: u64,
    /// In run order.
    pub tasks: Vec<TaskSnapshot>,
}

impl ChainSnapshot {
    pub fn capture(chain: &TaskChain) -> Self {
        Self {
            name: chain.name().to_string(),
            frame_budget: chain.frame_budget(),
            passes: chain.passes(),
            tasks: chain.tasks().iter().map(TaskSnapshot::capture).collect(),
        }
    }
}

/// Point-in-time view of a manager, for tooling and debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManagerSnapshot {
    pub name: String,
    pub now: f64,
    pub passes: u64,
    pub tasks_executed: u64,
    pub chains: Vec<ChainSnapshot>,
}

impl ManagerSnapshot {
    pub fn num_tasks(&self) -> usize {
        self.chains.iter().map(|c| c.tasks.len()).sum()
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn export_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
