//! Role State Machine.
//!
//! The workflow engine decides once whether an instance is the control
//! instance or a worker and passes that in. The role never changes; the phase
//! only moves forward along the role's own path:
//!
//! - control: `Unassigned → Planning → Launching → Joining → Done`
//! - worker:  `Unassigned → Configuring → Running → Reporting → Done`

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::FanoutConfig;
use crate::coordinator::monitor::{JoinMonitor, JoinOutcome};
use crate::coordinator::planner::{self, JoinRoster};
use crate::coordinator::step::{StepBody, StepContext};
use crate::error::{CoordinatorError, Result};
use crate::launch::local::LocalProcessBackend;
use crate::launch::{
    LaunchBackend, SiblingFailurePolicy, StepInvocation, TaskHandle, TaskSpec, join_processes,
};
use crate::rendezvous::framework::FrameworkAdapter;
use crate::rendezvous::placement::{PlacementContext, StaticPlacement};
use crate::rendezvous::{
    AddressResolver, HostnameResolver, LoopbackResolver, RendezvousFacts, RendezvousModel,
};
use crate::runtime::cancel::{CancelSignal, cancel_pair};
use crate::runtime::context::StoreContext;
use crate::runtime::identity::{FailedTask, TaskIdentity, TaskOutcome};
use crate::runtime::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Control,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unassigned,
    Planning,
    Launching,
    Joining,
    Configuring,
    Running,
    Reporting,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unassigned => "unassigned",
            Phase::Planning => "planning",
            Phase::Launching => "launching",
            Phase::Joining => "joining",
            Phase::Configuring => "configuring",
            Phase::Running => "running",
            Phase::Reporting => "reporting",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

impl Role {
    /// Phases this role passes through, in order.
    pub fn path(&self) -> &'static [Phase] {
        match self {
            Role::Control => &[
                Phase::Unassigned,
                Phase::Planning,
                Phase::Launching,
                Phase::Joining,
                Phase::Done,
            ],
            Role::Worker => &[
                Phase::Unassigned,
                Phase::Configuring,
                Phase::Running,
                Phase::Reporting,
                Phase::Done,
            ],
        }
    }

    pub fn allows(&self, from: Phase, to: Phase) -> bool {
        self.path().windows(2).any(|w| w[0] == from && w[1] == to)
    }
}

/// What a finished instance hands back to the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub role: Role,
    pub identity: TaskIdentity,
    pub facts: RendezvousFacts,
    pub outcome: TaskOutcome,
    /// Set for the control instance.
    pub join: Option<JoinOutcome>,
    pub roster: Option<JoinRoster>,
}

/// Drives one instance of a parallel step through its role's lifecycle.
pub struct ParallelStep {
    role: Role,
    identity: TaskIdentity,
    config: FanoutConfig,
    store: StoreContext,
    placement: Option<Arc<dyn PlacementContext>>,
    resolver: Arc<dyn AddressResolver>,
    backend: Arc<dyn LaunchBackend>,
    invocation: Option<StepInvocation>,
    adapters: Vec<Arc<dyn FrameworkAdapter>>,
    cancel: CancelSignal,
    // Guards against running (and so launching siblings) twice.
    started: AtomicBool,
    phase: watch::Sender<Phase>,
}

impl ParallelStep {
    pub fn new(
        role: Role,
        identity: TaskIdentity,
        config: FanoutConfig,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let store = StoreContext::new(identity.run_step(), store);
        let adapters: Vec<Arc<dyn FrameworkAdapter>> = config
            .framework
            .iter()
            .map(|f| Arc::from(f.build(&identity.run_id)))
            .collect();
        let (phase, _) = watch::channel(Phase::Unassigned);

        Self {
            role,
            identity,
            config,
            store,
            placement: None,
            resolver: Arc::new(HostnameResolver),
            backend: Arc::new(LocalProcessBackend::new()),
            invocation: None,
            adapters,
            cancel: CancelSignal::never(),
            started: AtomicBool::new(false),
            phase,
        }
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementContext>) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn LaunchBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// How siblings re-run the step body. Required by backends that launch.
    pub fn with_invocation(mut self, invocation: StepInvocation) -> Self {
        self.invocation = Some(invocation);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn FrameworkAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase changes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn store(&self) -> &StoreContext {
        &self.store
    }

    /// Runs this instance's lifecycle. Callable once per instance.
    pub async fn run(&self, body: &dyn StepBody) -> Result<StepReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase().to_string(),
                to: Phase::Unassigned.to_string(),
            });
        }
        self.config.validate()?;

        let result = match self.role {
            Role::Control => self.run_control(body).await,
            Role::Worker => self.run_worker(body).await,
        };

        if let Err(e) = &result {
            error!(task = %self.identity, role = ?self.role, phase = %self.phase(), error = %e, "Parallel step failed");
            self.report_early_failure(e).await;
        }
        result
    }

    async fn run_control(&self, body: &dyn StepBody) -> Result<StepReport> {
        let width = self.config.fanout_width;

        self.transition(Phase::Planning)?;
        let roster = planner::plan(&self.identity, width)?;
        self.store.publish_roster(&roster).await?;
        info!(control = %roster.control(), width, "Published join roster");

        let facts = self.control_facts(width)?;
        let control = roster.control().clone();

        self.transition(Phase::Launching)?;
        let handles = if self.backend.launches_siblings() {
            self.launch_siblings(&roster).await?
        } else {
            info!(backend = %self.backend.name(), "Siblings are started by the platform");
            Vec::new()
        };

        self.transition(Phase::Joining)?;
        let ctx = self.step_context(control.clone(), facts.clone());
        let (join, finished) = self.join_while_running(&roster, handles, body, &ctx).await;

        // A join that ended in error (cancellation) still leaves a record of
        // this instance behind.
        let own = match (&join, &finished) {
            (_, Some(own)) => own.clone(),
            (Err(e), None) => TaskOutcome::Failed(format!("fan-out aborted: {}", e)),
            (Ok(_), None) => TaskOutcome::Failed("fan-out failed before the body finished".to_string()),
        };
        self.store.publish_outcome(&control, &own).await?;
        self.transition(Phase::Done)?;

        let join = join?;
        // The control body's own failure counts as a failed instance of the fan-out.
        if let Some(reason) = finished.as_ref().and_then(TaskOutcome::failure_reason) {
            return Err(match join {
                JoinOutcome::Failed {
                    mut failed,
                    cancelled,
                } => {
                    failed.insert(
                        0,
                        FailedTask {
                            task: control,
                            reason,
                        },
                    );
                    CoordinatorError::TaskFailed { failed, cancelled }
                }
                _ => CoordinatorError::StepFailed {
                    task: control,
                    reason,
                },
            });
        }
        join.clone().into_result()?;

        info!(task = %control, width, "Fan-out joined");
        Ok(StepReport {
            role: Role::Control,
            identity: control,
            facts,
            outcome: own,
            join: Some(join),
            roster: Some(roster),
        })
    }

    async fn run_worker(&self, body: &dyn StepBody) -> Result<StepReport> {
        self.transition(Phase::Configuring)?;
        let placement = self.placement.as_ref().ok_or_else(|| {
            CoordinatorError::RendezvousUnavailable("worker has no placement context".to_string())
        })?;
        let facts = RendezvousModel::new(placement.as_ref(), self.resolver.as_ref())
            .facts(self.config.local_workers_per_node)?;
        if facts.node_index != self.identity.node_index {
            warn!(
                task = %self.identity,
                placed_at = facts.node_index,
                split_index = self.identity.split_index,
                "Placement disagrees with the task's split index"
            );
        }
        if facts.num_nodes != self.config.fanout_width {
            warn!(
                task = %self.identity,
                num_nodes = facts.num_nodes,
                width = self.config.fanout_width,
                "Placement node count differs from the fan-out width"
            );
        }

        self.transition(Phase::Running)?;
        let ctx = self.step_context(self.identity.clone(), facts.clone());
        let mut cancel = self.cancel.clone();
        let outcome = tokio::select! {
            outcome = run_body(body, &ctx) => outcome,
            _ = cancel.cancelled() => TaskOutcome::Failed("cancelled".to_string()),
        };

        self.transition(Phase::Reporting)?;
        self.store.publish_outcome(&self.identity, &outcome).await?;
        self.transition(Phase::Done)?;

        if let Some(reason) = outcome.failure_reason() {
            return Err(CoordinatorError::StepFailed {
                task: self.identity.clone(),
                reason,
            });
        }
        Ok(StepReport {
            role: Role::Worker,
            identity: self.identity.clone(),
            facts,
            outcome,
            join: None,
            roster: None,
        })
    }

    /// Facts for offset 0. Siblings started on this host share it, so they
    /// rendezvous over loopback; otherwise the platform's placement applies.
    fn control_facts(&self, width: usize) -> Result<RendezvousFacts> {
        let workers = self.config.local_workers_per_node;
        let facts = if self.backend.launches_siblings() {
            let placement = StaticPlacement::single_host(width, 0);
            RendezvousModel::new(&placement, &LoopbackResolver).facts(workers)?
        } else {
            let placement = self.placement.as_ref().ok_or_else(|| {
                CoordinatorError::RendezvousUnavailable(
                    "control instance has no placement context".to_string(),
                )
            })?;
            if placement.num_nodes() != width {
                return Err(CoordinatorError::RendezvousUnavailable(format!(
                    "platform granted {} node(s) for a fan-out of {}",
                    placement.num_nodes(),
                    width
                )));
            }
            RendezvousModel::new(placement.as_ref(), self.resolver.as_ref()).facts(workers)?
        };

        if facts.node_index != 0 {
            return Err(CoordinatorError::RendezvousUnavailable(format!(
                "control instance was placed at node {}",
                facts.node_index
            )));
        }
        Ok(facts)
    }

    /// Starts every sibling in ascending offset order. Any failure stops the
    /// ones already started; no partial fan-out proceeds.
    async fn launch_siblings(&self, roster: &JoinRoster) -> Result<Vec<TaskHandle>> {
        if roster.siblings().is_empty() {
            return Ok(Vec::new());
        }
        let invocation = self.invocation.clone().ok_or_else(|| {
            CoordinatorError::Config(format!(
                "backend {} launches siblings but no step invocation was given",
                self.backend.name()
            ))
        })?;

        let mut handles: Vec<TaskHandle> = Vec::with_capacity(roster.siblings().len());
        for sibling in roster.siblings() {
            let placement = StaticPlacement::single_host(roster.width(), sibling.node_index);
            let facts = RendezvousModel::new(&placement, &LoopbackResolver)
                .facts(self.config.local_workers_per_node)?;
            let spec = TaskSpec {
                identity: sibling.clone(),
                env: self.adapter_environment(&facts),
                facts,
                invocation: invocation.clone(),
            };

            match self.backend.submit(spec).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(task = %sibling, error = %format!("{:#}", e), "Sibling launch failed, aborting fan-out");
                    for handle in handles.iter_mut() {
                        if let Err(e) = self.backend.cancel(handle).await {
                            warn!(task = %handle.identity(), error = %e, "Failed to stop sibling");
                        }
                    }
                    for handle in handles.iter_mut() {
                        self.backend.wait(handle).await;
                    }
                    return Err(CoordinatorError::LaunchFailure {
                        task: sibling.clone(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        Ok(handles)
    }

    /// Joins on the siblings while the control instance's own body runs.
    ///
    /// If the join fails before the body is done, the body is abandoned: its
    /// peers are gone and it could only block. Under
    /// [`SiblingFailurePolicy::CancelRemaining`] a failed body stops the
    /// siblings in turn, since they would block on this instance.
    async fn join_while_running(
        &self,
        roster: &JoinRoster,
        handles: Vec<TaskHandle>,
        body: &dyn StepBody,
        ctx: &StepContext,
    ) -> (Result<JoinOutcome>, Option<TaskOutcome>) {
        let stop_on_body_failure =
            self.config.sibling_failure_policy == SiblingFailurePolicy::CancelRemaining;
        let (abort, abort_signal) = cancel_pair();
        let join = async {
            if self.backend.launches_siblings() {
                join_processes(
                    self.backend.clone(),
                    handles,
                    self.config.sibling_failure_policy,
                    abort_signal,
                    self.cancel.clone(),
                )
                .await
            } else {
                JoinMonitor::from_config(self.store.clone(), &self.config)
                    .with_cancel(self.cancel.clone())
                    .await_completion(roster)
                    .await
            }
        };
        let own = run_body(body, ctx);
        tokio::pin!(join);
        tokio::pin!(own);

        let mut joined: Option<Result<JoinOutcome>> = None;
        let mut finished: Option<TaskOutcome> = None;
        let joined = loop {
            tokio::select! {
                j = &mut join, if joined.is_none() => joined = Some(j),
                o = &mut own, if finished.is_none() => finished = Some(o),
            }
            if let Some(j) = joined.take() {
                let failed = !matches!(j, Ok(JoinOutcome::Succeeded));
                if failed && finished.is_none() {
                    warn!(task = %ctx.identity, "Fan-out failed, abandoning the control body");
                }
                if failed || finished.is_some() {
                    break j;
                }
                joined = Some(j);
            }
            let body_failed = matches!(finished, Some(TaskOutcome::Failed(_)));
            if body_failed && stop_on_body_failure && !abort.is_cancelled() {
                if !self.backend.launches_siblings() {
                    // The platform owns those siblings; stop waiting on them.
                    warn!(task = %ctx.identity, "Control body failed, abandoning the join");
                    break Ok(JoinOutcome::Failed {
                        failed: Vec::new(),
                        cancelled: Vec::new(),
                    });
                }
                warn!(task = %ctx.identity, "Control body failed, stopping siblings");
                abort.cancel();
            }
        };
        (joined, finished)
    }

    fn step_context(&self, identity: TaskIdentity, facts: RendezvousFacts) -> StepContext {
        StepContext {
            role: self.role,
            framework_env: self.adapter_environment(&facts),
            identity,
            facts,
            store: self.store.clone(),
        }
    }

    fn adapter_environment(&self, facts: &RendezvousFacts) -> Vec<(String, String)> {
        self.adapters
            .iter()
            .flat_map(|a| a.environment(facts))
            .collect()
    }

    fn transition(&self, to: Phase) -> Result<()> {
        let from = self.phase();
        if !self.role.allows(from, to) {
            return Err(CoordinatorError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.phase.send_replace(to);
        info!(task = %self.identity, role = ?self.role, phase = %to, "Phase change");
        Ok(())
    }

    /// Leaves a failed outcome behind for failures that happened before this
    /// instance reached its own reporting step, so joiners need not time out.
    async fn report_early_failure(&self, error: &CoordinatorError) {
        let reason = error.to_string();
        match self
            .store
            .publish_outcome(&self.identity, &TaskOutcome::Failed(reason))
            .await
        {
            Ok(()) => {}
            // Already reported on the normal path.
            Err(CoordinatorError::AlreadyPublished { .. }) => {}
            Err(e) => warn!(task = %self.identity, error = %e, "Could not record failure"),
        }
    }
}

async fn run_body(body: &dyn StepBody, ctx: &StepContext) -> TaskOutcome {
    match body.run(ctx).await {
        Ok(()) => TaskOutcome::Succeeded,
        Err(e) => {
            error!(task = %ctx.identity, body = %body.name(), error = %format!("{:#}", e), "Step body failed");
            TaskOutcome::Failed(format!("{:#}", e))
        }
    }
}
