use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::coordinator::planner::JoinRoster;
use crate::error::{CoordinatorError, Result};
use crate::runtime::identity::{RunStepIdentity, TaskIdentity, TaskOutcome};
use crate::runtime::storage::StateStore;

/// Typed view of the [`StateStore`] for one run and step.
/// Cheap to clone (just an `Arc`).
#[derive(Clone)]
pub struct StoreContext {
    run_step: RunStepIdentity,
    store: Arc<dyn StateStore>,
}

/// Published form of a task's terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub task: TaskIdentity,
    pub outcome: TaskOutcome,
}

impl StoreContext {
    pub fn new(run_step: RunStepIdentity, store: Arc<dyn StateStore>) -> Self {
        Self { run_step, store }
    }

    pub fn run_step(&self) -> &RunStepIdentity {
        &self.run_step
    }

    pub fn roster_key(&self, control_task_id: &str) -> String {
        format!(
            "fanjoin:{}:{}:roster:{}",
            self.run_step.run_id, self.run_step.step_name, control_task_id
        )
    }

    pub fn outcome_key(&self, task_id: &str) -> String {
        format!(
            "fanjoin:{}:{}:outcome:{}",
            self.run_step.run_id, self.run_step.step_name, task_id
        )
    }

    pub async fn publish_roster(&self, roster: &JoinRoster) -> Result<()> {
        let key = self.roster_key(&roster.control().task_id);
        let value = serde_json::to_value(roster).map_err(anyhow::Error::from)?;
        self.publish_once(key, value).await
    }

    pub async fn read_roster(&self, control_task_id: &str) -> Result<Option<JoinRoster>> {
        let key = self.roster_key(control_task_id);
        match self.store.read(&key).await? {
            Some(value) => {
                let roster = serde_json::from_value(value).map_err(anyhow::Error::from)?;
                Ok(Some(roster))
            }
            None => Ok(None),
        }
    }

    /// Publishes this task's terminal outcome. Each task writes only its own key.
    pub async fn publish_outcome(&self, task: &TaskIdentity, outcome: &TaskOutcome) -> Result<()> {
        if !outcome.is_terminal() {
            return Err(anyhow!("refusing to publish non-terminal outcome for {}", task).into());
        }
        let record = OutcomeRecord {
            task: task.clone(),
            outcome: outcome.clone(),
        };
        let value = serde_json::to_value(&record).map_err(anyhow::Error::from)?;
        self.publish_once(self.outcome_key(&task.task_id), value).await
    }

    /// Reads a task's outcome; a task that has not reported yet is `Running`.
    pub async fn read_outcome(&self, task: &TaskIdentity) -> Result<TaskOutcome> {
        let key = self.outcome_key(&task.task_id);
        match self.store.read(&key).await? {
            Some(value) => {
                let record: OutcomeRecord =
                    serde_json::from_value(value).map_err(anyhow::Error::from)?;
                Ok(record.outcome)
            }
            None => Ok(TaskOutcome::Running),
        }
    }

    async fn publish_once(&self, key: String, value: serde_json::Value) -> Result<()> {
        if self.store.publish(&key, value).await? {
            Ok(())
        } else {
            Err(CoordinatorError::AlreadyPublished { key })
        }
    }
}
