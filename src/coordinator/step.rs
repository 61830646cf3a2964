use std::fmt::Debug;
use std::process::Stdio;

use anyhow::{Context as AnyhowContext, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::coordinator::role::Role;
use crate::launch::{StepInvocation, identity_environment};
use crate::rendezvous::RendezvousFacts;
use crate::runtime::context::StoreContext;
use crate::runtime::identity::TaskIdentity;

/// What one instance sees while its step body runs.
#[derive(Clone)]
pub struct StepContext {
    pub role: Role,
    pub identity: TaskIdentity,
    pub facts: RendezvousFacts,
    pub store: StoreContext,
    /// Variables contributed by framework adapters.
    pub framework_env: Vec<(String, String)>,
}

impl StepContext {
    /// Identity, rendezvous record and adapter variables, in that order.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars = identity_environment(&self.identity);
        vars.extend(self.facts.environment());
        vars.extend(self.framework_env.iter().cloned());
        vars
    }
}

/// The user's step body. Every instance runs it exactly once.
#[async_trait]
pub trait StepBody: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &StepContext) -> Result<()>;
}

/// Runs an external command as the step body, with the rendezvous
/// environment applied. A non-zero exit fails the body.
#[derive(Debug, Clone)]
pub struct CommandStep {
    invocation: StepInvocation,
}

impl CommandStep {
    pub fn new(invocation: StepInvocation) -> Self {
        Self { invocation }
    }
}

#[async_trait]
impl StepBody for CommandStep {
    fn name(&self) -> &str {
        &self.invocation.program
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        info!(task = %ctx.identity, program = %self.invocation.program, "Running step command");
        let status = Command::new(&self.invocation.program)
            .args(&self.invocation.args)
            .envs(ctx.environment())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.invocation.program))?;

        if !status.success() {
            bail!("{} exited with {}", self.invocation.program, status);
        }
        Ok(())
    }
}
