//! Backend Launch Adapters.
//!
//! A backend accepts a [`TaskSpec`] for one sibling and returns a
//! [`TaskHandle`]. Backends that start siblings themselves (local processes)
//! are joined through [`join_processes`]; backends whose platform already
//! started every instance are joined by polling published outcomes.

pub mod local;
pub mod platform;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::coordinator::monitor::JoinOutcome;
use crate::error::CoordinatorError;
use crate::rendezvous::RendezvousFacts;
use crate::runtime::cancel::{CancelSignal, cancel_pair};
use crate::runtime::identity::{FailedTask, TaskIdentity, TaskOutcome};

pub const ENV_RUN_ID: &str = "FANJOIN_RUN_ID";
pub const ENV_STEP_NAME: &str = "FANJOIN_STEP_NAME";
pub const ENV_TASK_ID: &str = "FANJOIN_TASK_ID";
pub const ENV_SPLIT_INDEX: &str = "FANJOIN_SPLIT_INDEX";

/// What to do with healthy siblings once one of them fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingFailurePolicy {
    /// Kill every sibling still running and report the failure right away.
    #[default]
    CancelRemaining,
    /// Let every sibling run to its natural exit before reporting.
    WaitAll,
}

/// Variables that tell a started instance who it is.
pub fn identity_environment(identity: &TaskIdentity) -> Vec<(String, String)> {
    vec![
        (ENV_RUN_ID.to_string(), identity.run_id.clone()),
        (ENV_STEP_NAME.to_string(), identity.step_name.clone()),
        (ENV_TASK_ID.to_string(), identity.task_id.clone()),
        (ENV_SPLIT_INDEX.to_string(), identity.split_index.to_string()),
    ]
}

/// Entry point and arguments that re-run the step body in a sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl StepInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything a backend needs to bring up one sibling.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub identity: TaskIdentity,
    pub facts: RendezvousFacts,
    pub invocation: StepInvocation,
    /// Additional variables, e.g. from framework adapters.
    pub env: Vec<(String, String)>,
}

impl TaskSpec {
    /// Process configuration injected into the sibling before it starts.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = identity_environment(&self.identity);
        vars.extend(self.facts.environment());
        vars.extend(self.env.iter().cloned());
        vars
    }
}

/// A submitted sibling. Holds the child process when the backend owns one.
#[derive(Debug)]
pub struct TaskHandle {
    identity: TaskIdentity,
    process: Option<Child>,
}

impl TaskHandle {
    pub fn process(identity: TaskIdentity, child: Child) -> Self {
        Self {
            identity,
            process: Some(child),
        }
    }

    /// Handle for an instance the platform started on its own.
    pub fn platform(identity: TaskIdentity) -> Self {
        Self {
            identity,
            process: None,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|c| c.id())
    }

    pub(crate) fn child_mut(&mut self) -> Option<&mut Child> {
        self.process.as_mut()
    }
}

/// Capability contract every compute backend implements.
#[async_trait]
pub trait LaunchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the control instance must start its siblings itself.
    fn launches_siblings(&self) -> bool;

    /// Starts one sibling, or confirms the platform already started it.
    async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle>;

    /// Blocks until the sibling is terminal. Poll-only backends return
    /// `Running` immediately.
    async fn wait(&self, handle: &mut TaskHandle) -> TaskOutcome;

    /// Best-effort stop. Not every backend can honour it.
    async fn cancel(&self, handle: &mut TaskHandle) -> Result<()>;
}

struct Waited {
    task: TaskIdentity,
    outcome: TaskOutcome,
    cancelled: bool,
}

/// Waits on every started sibling and aggregates their exits.
///
/// Completion order is whatever the processes produce. Under
/// [`SiblingFailurePolicy::CancelRemaining`] the first failure cancels every
/// other wait, which kills its process; those siblings are reported as
/// cancelled rather than failed. `abort` stops the siblings the same way when
/// the caller's own share of the work failed. `cancel` aborts the whole join.
pub async fn join_processes(
    backend: Arc<dyn LaunchBackend>,
    handles: Vec<TaskHandle>,
    policy: SiblingFailurePolicy,
    abort: CancelSignal,
    cancel: CancelSignal,
) -> crate::Result<JoinOutcome> {
    let (stop, stop_signal) = cancel_pair();
    let mut waits = JoinSet::new();
    let mut tasks = HashMap::new();

    for mut handle in handles {
        let backend = backend.clone();
        let mut stop_signal = stop_signal.clone();
        let mut aborted = abort.clone();
        let mut external = cancel.clone();
        let task = handle.identity().clone();

        let wait = waits.spawn(async move {
            // A sibling that already exited keeps its real outcome.
            let finished = tokio::select! {
                biased;
                outcome = backend.wait(&mut handle) => Some(outcome),
                _ = stop_signal.cancelled() => None,
                _ = aborted.cancelled() => None,
                _ = external.cancelled() => None,
            };
            let task = handle.identity().clone();
            match finished {
                Some(outcome) => Waited {
                    task,
                    outcome,
                    cancelled: false,
                },
                None => {
                    if let Err(e) = backend.cancel(&mut handle).await {
                        warn!(task = %task, error = %e, "Failed to cancel sibling");
                    }
                    let outcome = backend.wait(&mut handle).await;
                    Waited {
                        task,
                        outcome,
                        cancelled: true,
                    }
                }
            }
        });
        tasks.insert(wait.id(), task);
    }

    let mut failed = Vec::new();
    let mut cancelled = Vec::new();

    while let Some(joined) = waits.join_next_with_id().await {
        let waited = match joined {
            Ok((_, waited)) => waited,
            Err(e) => {
                // A wait that panicked leaves its sibling in an unknown state.
                let Some(task) = tasks.get(&e.id()).cloned() else {
                    error!(error = %e, "Lost track of a sibling wait");
                    continue;
                };
                error!(task = %task, error = %e, "Sibling wait aborted");
                Waited {
                    task,
                    outcome: TaskOutcome::Failed(format!("wait aborted: {}", e)),
                    cancelled: false,
                }
            }
        };

        match waited.outcome {
            TaskOutcome::Succeeded => {
                info!(task = %waited.task, "Sibling finished");
            }
            _ if waited.cancelled => {
                cancelled.push(waited.task);
            }
            outcome => {
                let reason = outcome
                    .failure_reason()
                    .unwrap_or_else(|| "no terminal status".to_string());
                warn!(task = %waited.task, reason = %reason, "Sibling failed");
                failed.push(FailedTask {
                    task: waited.task,
                    reason,
                });
                if policy == SiblingFailurePolicy::CancelRemaining && !stop.is_cancelled() {
                    warn!("Cancelling remaining siblings after first failure");
                    stop.cancel();
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(CoordinatorError::Cancelled(
            "joining sibling processes".to_string(),
        ));
    }

    if failed.is_empty() && cancelled.is_empty() {
        return Ok(JoinOutcome::Succeeded);
    }

    failed.sort_by_key(|f| f.task.split_index);
    cancelled.sort_by_key(|t| t.split_index);
    Ok(JoinOutcome::Failed { failed, cancelled })
}
