//! Join Monitor.
//!
//! Polls the published outcomes of every sibling in a roster until all are
//! terminal, one reports failure, or the timeout elapses. A sibling that
//! crashed before reporting is indistinguishable from a slow one; only the
//! timeout catches it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::FanoutConfig;
use crate::coordinator::planner::JoinRoster;
use crate::error::{CoordinatorError, Result};
use crate::runtime::cancel::CancelSignal;
use crate::runtime::context::StoreContext;
use crate::runtime::identity::{FailedTask, TaskIdentity, TaskOutcome};

/// Aggregate result of joining on a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    Succeeded,
    Failed {
        failed: Vec<FailedTask>,
        /// Siblings stopped because another one failed.
        #[serde(default)]
        cancelled: Vec<TaskIdentity>,
    },
    TimedOut {
        waited: Duration,
        pending: Vec<TaskIdentity>,
    },
}

impl JoinOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JoinOutcome::Succeeded)
    }

    /// Tasks an operator should inspect.
    pub fn implicated_tasks(&self) -> Vec<TaskIdentity> {
        match self {
            JoinOutcome::Succeeded => Vec::new(),
            JoinOutcome::Failed { failed, .. } => failed.iter().map(|f| f.task.clone()).collect(),
            JoinOutcome::TimedOut { pending, .. } => pending.clone(),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            JoinOutcome::Succeeded => Ok(()),
            JoinOutcome::Failed { failed, cancelled } => {
                Err(CoordinatorError::TaskFailed { failed, cancelled })
            }
            JoinOutcome::TimedOut { waited, pending } => Err(CoordinatorError::JoinTimeout {
                timeout: waited,
                pending,
            }),
        }
    }
}

pub struct JoinMonitor {
    store: StoreContext,
    timeout: Duration,
    poll_interval: Duration,
    cancel: CancelSignal,
}

impl JoinMonitor {
    pub fn new(store: StoreContext, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            store,
            timeout,
            poll_interval,
            cancel: CancelSignal::never(),
        }
    }

    pub fn from_config(store: StoreContext, config: &FanoutConfig) -> Self {
        Self::new(store, config.join_timeout(), config.join_poll_interval())
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Waits for every sibling in `roster`. The control task's own outcome is
    /// implied by the caller running this.
    pub async fn await_completion(&self, roster: &JoinRoster) -> Result<JoinOutcome> {
        let mut pending: Vec<TaskIdentity> = roster.siblings().to_vec();
        if pending.is_empty() {
            return Ok(JoinOutcome::Succeeded);
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep_until(started + self.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel = self.cancel.clone();

        info!(
            control = %roster.control(),
            siblings = pending.len(),
            timeout = ?self.timeout,
            "Waiting for siblings to finish"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CoordinatorError::Cancelled("joining siblings".to_string()));
                }
                _ = &mut deadline => {
                    warn!(pending = pending.len(), waited = ?started.elapsed(), "Join timed out");
                    return Ok(JoinOutcome::TimedOut {
                        waited: self.timeout,
                        pending,
                    });
                }
                _ = ticker.tick() => {}
            }

            let mut still_running = Vec::with_capacity(pending.len());
            let mut failed = Vec::new();
            for task in pending.drain(..) {
                match self.store.read_outcome(&task).await {
                    Ok(TaskOutcome::Succeeded) => {
                        debug!(task = %task, "Sibling succeeded");
                    }
                    Ok(TaskOutcome::Running) => still_running.push(task),
                    Ok(outcome) => {
                        let reason = outcome.failure_reason().unwrap_or_default();
                        failed.push(FailedTask { task, reason });
                    }
                    Err(e) => {
                        // Not observed yet. Only an explicit record or the
                        // timeout may fail the join.
                        warn!(task = %task, error = %e, "Could not read sibling outcome");
                        still_running.push(task);
                    }
                }
            }

            if !failed.is_empty() {
                for f in &failed {
                    warn!(task = %f.task, reason = %f.reason, "Sibling reported failure");
                }
                failed.sort_by_key(|f| f.task.split_index);
                return Ok(JoinOutcome::Failed {
                    failed,
                    cancelled: Vec::new(),
                });
            }

            pending = still_running;
            if pending.is_empty() {
                info!(elapsed = ?started.elapsed(), "All siblings finished");
                return Ok(JoinOutcome::Succeeded);
            }
            debug!(remaining = pending.len(), elapsed = ?started.elapsed(), "Siblings still running");
        }
    }
}
