use std::time::Duration;

use crate::runtime::identity::{FailedTask, TaskIdentity};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid fan-out width {width}: at least one task is required")]
    InvalidFanout { width: usize },

    #[error("rendezvous unavailable: {0}")]
    RendezvousUnavailable(String),

    #[error("failed to launch {task}: {reason}")]
    LaunchFailure { task: TaskIdentity, reason: String },

    #[error("fan-out failed, {} task(s) reported failure: {}", .failed.len(), describe_failures(.failed))]
    TaskFailed {
        failed: Vec<FailedTask>,
        cancelled: Vec<TaskIdentity>,
    },

    #[error("join timed out after {timeout:?}, still waiting on: {}", describe_tasks(.pending))]
    JoinTimeout {
        timeout: Duration,
        pending: Vec<TaskIdentity>,
    },

    #[error("step body failed on {task}: {reason}")]
    StepFailed { task: TaskIdentity, reason: String },

    #[error("key {key} was already published")]
    AlreadyPublished { key: String },

    #[error("invalid phase transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled while {0}")]
    Cancelled(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Task identities an operator should look at for this failure.
    pub fn implicated_tasks(&self) -> Vec<TaskIdentity> {
        match self {
            CoordinatorError::LaunchFailure { task, .. } => vec![task.clone()],
            CoordinatorError::TaskFailed { failed, .. } => {
                failed.iter().map(|f| f.task.clone()).collect()
            }
            CoordinatorError::JoinTimeout { pending, .. } => pending.clone(),
            CoordinatorError::StepFailed { task, .. } => vec![task.clone()],
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failed: &[FailedTask]) -> String {
    failed
        .iter()
        .map(|f| format!("{} ({})", f.task, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_tasks(tasks: &[TaskIdentity]) -> String {
    tasks
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CoordinatorError>;
