use std::fmt;

use serde::{Deserialize, Serialize};

/// Run and step a parallel fan-out belongs to. Assigned by the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunStepIdentity {
    pub run_id: String,
    pub step_name: String,
}

impl RunStepIdentity {
    pub fn new(run_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_name: step_name.into(),
        }
    }
}

/// One instance of a fan-out.
///
/// `split_index` orders the instances for the downstream join step and equals
/// `node_index`, since exactly one instance runs per node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub run_id: String,
    pub step_name: String,
    pub task_id: String,
    pub split_index: usize,
    pub node_index: usize,
}

impl TaskIdentity {
    pub fn new(run_step: &RunStepIdentity, task_id: impl Into<String>, node_index: usize) -> Self {
        Self {
            run_id: run_step.run_id.clone(),
            step_name: run_step.step_name.clone(),
            task_id: task_id.into(),
            split_index: node_index,
            node_index,
        }
    }

    pub fn run_step(&self) -> RunStepIdentity {
        RunStepIdentity::new(self.run_id.clone(), self.step_name.clone())
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.step_name, self.task_id)
    }
}

/// Lifecycle result of one task instance.
///
/// Only terminal outcomes are ever published; a missing record reads as
/// `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Running,
    Succeeded,
    Failed(String),
    TimedOut,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    /// Failure reason for terminal non-success outcomes.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            TaskOutcome::Failed(reason) => Some(reason.clone()),
            TaskOutcome::TimedOut => Some("timed out".to_string()),
            _ => None,
        }
    }
}

/// A task implicated in a failed fan-out, with the reason it gave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task: TaskIdentity,
    pub reason: String,
}
