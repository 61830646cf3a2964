use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::launch::{LaunchBackend, TaskHandle, TaskSpec};
use crate::runtime::identity::TaskOutcome;

/// Runs every sibling as a child process on this host.
///
/// Rendezvous facts and the sibling's identity are injected as environment
/// variables before the process starts. The control instance is offset 0 and
/// is never forked.
#[derive(Debug, Default, Clone)]
pub struct LocalProcessBackend {
    working_dir: Option<PathBuf>,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl LaunchBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn launches_siblings(&self) -> bool {
        true
    }

    async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let mut cmd = Command::new(&spec.invocation.program);
        cmd.args(&spec.invocation.args)
            .envs(spec.environment())
            .stdin(Stdio::null())
            // Dropping the handle (e.g. the control process is torn down)
            // takes the sibling with it.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(task = %spec.identity, program = %spec.invocation.program, args = ?spec.invocation.args, "Spawning sibling");
        let child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start {} for {}",
                spec.invocation.program, spec.identity
            )
        })?;

        info!(
            task = %spec.identity,
            node_index = spec.identity.node_index,
            pid = child.id(),
            "Started sibling process"
        );
        Ok(TaskHandle::process(spec.identity, child))
    }

    async fn wait(&self, handle: &mut TaskHandle) -> TaskOutcome {
        let Some(child) = handle.child_mut() else {
            return TaskOutcome::Running;
        };
        match child.wait().await {
            Ok(status) if status.success() => TaskOutcome::Succeeded,
            Ok(status) => TaskOutcome::Failed(format!("process exited with {}", status)),
            Err(e) => TaskOutcome::Failed(format!("failed to wait on process: {}", e)),
        }
    }

    async fn cancel(&self, handle: &mut TaskHandle) -> Result<()> {
        let task = handle.identity().clone();
        if let Some(child) = handle.child_mut() {
            // An already-exited child needs no signal.
            if child.try_wait()?.is_none() {
                child.start_kill().with_context(|| format!("Failed to kill {}", task))?;
                info!(task = %task, "Killed sibling process");
            }
        }
        Ok(())
    }
}
