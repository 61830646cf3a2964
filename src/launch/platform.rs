use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::launch::{LaunchBackend, TaskHandle, TaskSpec};
use crate::runtime::identity::TaskOutcome;

/// Backends whose platform starts all instances of the fan-out as one job
/// (multi-node batch jobs, gang-scheduled pods).
///
/// Nothing is launched here; `wait` is poll-only, so the control instance
/// joins through the published outcomes instead. Cancellation belongs to the
/// platform's own job-level primitive.
#[derive(Debug, Clone)]
pub struct PlatformBackend {
    name: String,
}

impl PlatformBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl LaunchBackend for PlatformBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn launches_siblings(&self) -> bool {
        false
    }

    async fn submit(&self, spec: TaskSpec) -> Result<TaskHandle> {
        debug!(backend = %self.name, task = %spec.identity, "Sibling is started by the platform");
        Ok(TaskHandle::platform(spec.identity))
    }

    async fn wait(&self, _handle: &mut TaskHandle) -> TaskOutcome {
        TaskOutcome::Running
    }

    async fn cancel(&self, handle: &mut TaskHandle) -> Result<()> {
        info!(
            backend = %self.name,
            task = %handle.identity(),
            "Cancellation is delegated to the platform's job controls"
        );
        Ok(())
    }
}
