use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use fanjoin::CoordinatorError;
use fanjoin::config::FanoutConfig;
use fanjoin::coordinator::{JoinOutcome, ParallelStep, Phase, Role, StepBody, StepContext};
use fanjoin::launch::platform::PlatformBackend;
use fanjoin::rendezvous::framework::{FrameworkAdapter, FrameworkConfig};
use fanjoin::rendezvous::{LoopbackResolver, RendezvousFacts};
use fanjoin::rendezvous::placement::StaticPlacement;
use fanjoin::runtime::context::StoreContext;
use fanjoin::runtime::identity::{RunStepIdentity, TaskIdentity, TaskOutcome};
use fanjoin::runtime::storage::{InMemoryStateStore, StateStore};

/// Records the environment it was run with.
#[derive(Debug, Default)]
struct RecordingBody {
    seen: Mutex<Option<HashMap<String, String>>>,
}

impl RecordingBody {
    fn env(&self) -> HashMap<String, String> {
        self.seen.lock().unwrap().clone().expect("body did not run")
    }
}

#[async_trait]
impl StepBody for RecordingBody {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        *self.seen.lock().unwrap() = Some(ctx.environment().into_iter().collect());
        Ok(())
    }
}

#[derive(Debug)]
struct FailingBody;

#[async_trait]
impl StepBody for FailingBody {
    fn name(&self) -> &str {
        "failing"
    }

    async fn run(&self, _ctx: &StepContext) -> Result<()> {
        bail!("loss went to NaN")
    }
}

fn run_step() -> RunStepIdentity {
    RunStepIdentity::new("1712", "train")
}

fn task(task_id: &str, index: usize) -> TaskIdentity {
    TaskIdentity::new(&run_step(), task_id, index)
}

fn fast_config(width: usize) -> FanoutConfig {
    let mut config = FanoutConfig::new(width);
    config.join_timeout_seconds = 5;
    config.join_poll_interval_seconds = 1;
    config
}

#[tokio::test]
async fn test_worker_publishes_its_outcome() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let body = RecordingBody::default();
    let step = ParallelStep::new(Role::Worker, task("abc-node-2", 2), fast_config(3), store.clone())
        .with_placement(Arc::new(StaticPlacement::single_host(3, 2)));

    let report = step.run(&body).await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Succeeded);
    assert_eq!(report.facts.node_index, 2);
    assert_eq!(report.facts.world_size, 3);
    assert!(report.join.is_none());
    assert_eq!(step.phase(), Phase::Done);

    let env = body.env();
    assert_eq!(env["FANJOIN_TASK_ID"], "abc-node-2");
    assert_eq!(env["FANJOIN_NODE_INDEX"], "2");
    assert_eq!(env["FANJOIN_MAIN_ADDR"], "127.0.0.1");

    let ctx = StoreContext::new(run_step(), store);
    assert_eq!(
        ctx.read_outcome(&task("abc-node-2", 2)).await.unwrap(),
        TaskOutcome::Succeeded
    );
}

#[tokio::test]
async fn test_failing_worker_reports_failure() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Worker, task("abc-node-1", 1), fast_config(2), store.clone())
        .with_placement(Arc::new(StaticPlacement::single_host(2, 1)));

    let err = step.run(&FailingBody).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::StepFailed { .. }));

    let ctx = StoreContext::new(run_step(), store);
    match ctx.read_outcome(&task("abc-node-1", 1)).await.unwrap() {
        TaskOutcome::Failed(reason) => assert!(reason.contains("NaN")),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_worker_without_placement_is_unavailable() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Worker, task("abc-node-1", 1), fast_config(2), store.clone());

    let err = step.run(&RecordingBody::default()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::RendezvousUnavailable(_)));

    // Joiners see the failure instead of waiting for the timeout.
    let ctx = StoreContext::new(run_step(), store);
    assert!(matches!(
        ctx.read_outcome(&task("abc-node-1", 1)).await.unwrap(),
        TaskOutcome::Failed(_)
    ));
}

#[tokio::test]
async fn test_platform_control_joins_published_outcomes() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let ctx = StoreContext::new(run_step(), store.clone());
    ctx.publish_outcome(&task("abc-node-1", 1), &TaskOutcome::Succeeded).await.unwrap();
    ctx.publish_outcome(&task("abc-node-2", 2), &TaskOutcome::Succeeded).await.unwrap();

    let body = RecordingBody::default();
    let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(3), store)
        .with_backend(Arc::new(PlatformBackend::new("batch")))
        .with_placement(Arc::new(StaticPlacement::new(3, 0, None)))
        .with_resolver(Arc::new(LoopbackResolver));

    let report = step.run(&body).await.unwrap();
    assert_eq!(report.join, Some(JoinOutcome::Succeeded));
    assert_eq!(report.roster.as_ref().map(|r| r.width()), Some(3));
    assert_eq!(report.facts.global_rank_base, 0);

    // The roster and the control outcome are both on record.
    let roster = ctx.read_roster("control-abc").await.unwrap().unwrap();
    assert_eq!(roster.task_ids(), vec!["control-abc", "abc-node-1", "abc-node-2"]);
    assert_eq!(
        ctx.read_outcome(&task("control-abc", 0)).await.unwrap(),
        TaskOutcome::Succeeded
    );
    assert_eq!(body.env()["FANJOIN_NUM_NODES"], "3");
}

#[tokio::test]
async fn test_platform_control_fails_on_sibling_failure() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let ctx = StoreContext::new(run_step(), store.clone());
    ctx.publish_outcome(&task("abc-node-1", 1), &TaskOutcome::Failed("oom".to_string()))
        .await
        .unwrap();

    let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(3), store)
        .with_backend(Arc::new(PlatformBackend::new("batch")))
        .with_placement(Arc::new(StaticPlacement::new(3, 0, None)))
        .with_resolver(Arc::new(LoopbackResolver));

    let err = step.run(&RecordingBody::default()).await.unwrap_err();
    match &err {
        CoordinatorError::TaskFailed { failed, .. } => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].task.task_id, "abc-node-1");
        }
        other => panic!("expected task failure, got {:?}", other),
    }
    assert!(ctx.read_outcome(&task("control-abc", 0)).await.unwrap().is_terminal());
}

#[tokio::test]
async fn test_platform_control_times_out_on_silent_sibling() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let mut config = fast_config(2);
    config.join_timeout_seconds = 2;

    let step = ParallelStep::new(Role::Control, task("control-abc", 0), config, store)
        .with_backend(Arc::new(PlatformBackend::new("batch")))
        .with_placement(Arc::new(StaticPlacement::new(2, 0, None)))
        .with_resolver(Arc::new(LoopbackResolver));

    let err = tokio::time::timeout(Duration::from_secs(10), step.run(&RecordingBody::default()))
        .await
        .expect("join never timed out")
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::JoinTimeout { .. }));
    assert_eq!(err.implicated_tasks()[0].task_id, "abc-node-1");
}

#[tokio::test]
async fn test_platform_node_count_must_match_width() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(4), store)
        .with_backend(Arc::new(PlatformBackend::new("batch")))
        .with_placement(Arc::new(StaticPlacement::new(2, 0, None)))
        .with_resolver(Arc::new(LoopbackResolver));

    let err = step.run(&RecordingBody::default()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::RendezvousUnavailable(_)));
}

#[tokio::test]
async fn test_width_one_runs_control_only() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let body = RecordingBody::default();
    // Local backend, no invocation: nothing to launch.
    let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(1), store);

    let report = step.run(&body).await.unwrap();
    assert_eq!(report.join, Some(JoinOutcome::Succeeded));
    assert_eq!(report.facts.main_node_address, "127.0.0.1");
    assert_eq!(body.env()["FANJOIN_WORLD_SIZE"], "1");
}

#[tokio::test]
async fn test_run_twice_is_rejected() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(1), store);

    step.run(&RecordingBody::default()).await.unwrap();
    let err = step.run(&RecordingBody::default()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_invalid_width_is_rejected_before_planning() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Control, task("control-abc", 0), FanoutConfig::new(0), store);

    let err = step.run(&RecordingBody::default()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidFanout { width: 0 }));
}

#[tokio::test]
async fn test_phases_follow_the_role_path() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let step = ParallelStep::new(Role::Worker, task("abc-node-1", 1), fast_config(2), store)
        .with_placement(Arc::new(StaticPlacement::single_host(2, 1)));
    let mut phases = step.subscribe();
    assert_eq!(*phases.borrow_and_update(), Phase::Unassigned);

    step.run(&RecordingBody::default()).await.unwrap();
    assert_eq!(*phases.borrow_and_update(), Phase::Done);

    assert!(Role::Worker.allows(Phase::Configuring, Phase::Running));
    assert!(!Role::Worker.allows(Phase::Running, Phase::Configuring));
    assert!(!Role::Control.allows(Phase::Unassigned, Phase::Running));
}

#[tokio::test]
async fn test_framework_adapter_reaches_the_body() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let mut config = fast_config(2);
    config.framework = Some(FrameworkConfig::TorchDistributed {
        master_port: Some(29500),
        process_group_backend: None,
    });
    let body = RecordingBody::default();
    let step = ParallelStep::new(Role::Worker, task("abc-node-1", 1), config, store)
        .with_placement(Arc::new(StaticPlacement::new(2, 1, Some("10.0.0.5".to_string()))));

    step.run(&body).await.unwrap();
    let env = body.env();
    assert_eq!(env["MASTER_ADDR"], "10.0.0.5");
    assert_eq!(env["MASTER_PORT"], "29500");
    assert_eq!(env["NODE_RANK"], "1");
    assert_eq!(env["PL_TORCH_DISTRIBUTED_BACKEND"], "gloo");
}

#[tokio::test]
async fn test_failed_control_body_ends_platform_join() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let mut config = fast_config(3);
    config.join_timeout_seconds = 30;

    let step = ParallelStep::new(Role::Control, task("control-abc", 0), config, store)
        .with_backend(Arc::new(PlatformBackend::new("batch")))
        .with_placement(Arc::new(StaticPlacement::new(3, 0, None)))
        .with_resolver(Arc::new(LoopbackResolver));

    // Siblings never report; the join must not wait out its timeout.
    let err = tokio::time::timeout(Duration::from_secs(10), step.run(&FailingBody))
        .await
        .expect("control waited on siblings after its own body failed")
        .unwrap_err();
    match &err {
        CoordinatorError::TaskFailed { failed, .. } => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].task.task_id, "control-abc");
            assert!(failed[0].reason.contains("NaN"));
        }
        other => panic!("expected task failure, got {:?}", other),
    }
    assert!(matches!(
        step.store().read_outcome(&task("control-abc", 0)).await.unwrap(),
        TaskOutcome::Failed(_)
    ));
}

/// Exposes a fixed variable to every instance.
#[derive(Debug)]
struct StaticAdapter;

impl FrameworkAdapter for StaticAdapter {
    fn name(&self) -> &str {
        "static"
    }

    fn environment(&self, facts: &RendezvousFacts) -> Vec<(String, String)> {
        vec![("PEERS".to_string(), facts.num_nodes.to_string())]
    }
}

#[tokio::test]
async fn test_custom_adapter_reaches_the_body() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let body = RecordingBody::default();
    let step = ParallelStep::new(Role::Worker, task("abc-node-1", 1), fast_config(2), store)
        .with_placement(Arc::new(StaticPlacement::single_host(2, 1)))
        .with_adapter(Arc::new(StaticAdapter));
    assert_eq!(step.role(), Role::Worker);

    step.run(&body).await.unwrap();
    assert_eq!(body.env()["PEERS"], "2");
    assert_eq!(
        step.store().read_outcome(step.identity()).await.unwrap(),
        TaskOutcome::Succeeded
    );
}

#[cfg(unix)]
mod local {
    use super::*;
    use fanjoin::launch::{SiblingFailurePolicy, StepInvocation};

    #[tokio::test]
    async fn test_local_fanout_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let script = format!("touch {}/ran-$FANJOIN_TASK_ID", dir.path().display());

        let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(3), store)
            .with_invocation(StepInvocation::new("sh", ["-c", script.as_str()]));
        let report = step.run(&RecordingBody::default()).await.unwrap();

        assert_eq!(report.join, Some(JoinOutcome::Succeeded));
        assert!(dir.path().join("ran-abc-node-1").exists());
        assert!(dir.path().join("ran-abc-node-2").exists());
        assert!(!dir.path().join("ran-control-abc").exists());
    }

    #[tokio::test]
    async fn test_local_wait_all_reports_the_failed_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let script = format!(
            "if [ \"$FANJOIN_SPLIT_INDEX\" = 2 ]; then exit 1; fi; sleep 0.3; touch {}/done-$FANJOIN_SPLIT_INDEX",
            dir.path().display()
        );
        let mut config = fast_config(4);
        config.sibling_failure_policy = SiblingFailurePolicy::WaitAll;

        let step = ParallelStep::new(Role::Control, task("control-abc", 0), config, store)
            .with_invocation(StepInvocation::new("sh", ["-c", script.as_str()]));
        let err = step.run(&RecordingBody::default()).await.unwrap_err();

        match &err {
            CoordinatorError::TaskFailed { failed, cancelled } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].task.task_id, "abc-node-2");
                assert!(cancelled.is_empty());
            }
            other => panic!("expected task failure, got {:?}", other),
        }
        assert!(dir.path().join("done-1").exists());
        assert!(dir.path().join("done-3").exists());
    }

    #[tokio::test]
    async fn test_launch_failure_aborts_the_fanout() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(3), store.clone())
            .with_invocation(StepInvocation::new("/nonexistent/fanjoin-step", Vec::<String>::new()));

        let err = step.run(&RecordingBody::default()).await.unwrap_err();
        match &err {
            CoordinatorError::LaunchFailure { task, .. } => assert_eq!(task.task_id, "abc-node-1"),
            other => panic!("expected launch failure, got {:?}", other),
        }

        let ctx = StoreContext::new(run_step(), store);
        assert!(matches!(
            ctx.read_outcome(&super::task("control-abc", 0)).await.unwrap(),
            TaskOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_local_backend_requires_an_invocation() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let step = ParallelStep::new(Role::Control, task("control-abc", 0), fast_config(2), store);

        let err = step.run(&RecordingBody::default()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }

    #[tokio::test]
    async fn test_failed_control_body_stops_siblings() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let config = fast_config(3);
        assert_eq!(config.sibling_failure_policy, SiblingFailurePolicy::CancelRemaining);

        let step = ParallelStep::new(Role::Control, task("control-abc", 0), config, store)
            .with_invocation(StepInvocation::new("sh", ["-c", "sleep 30"]));

        let start = std::time::Instant::now();
        let err = step.run(&FailingBody).await.unwrap_err();
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "siblings were waited out: {:?}",
            start.elapsed()
        );

        match &err {
            CoordinatorError::TaskFailed { failed, cancelled } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].task.task_id, "control-abc");
                let ids: Vec<&str> = cancelled.iter().map(|t| t.task_id.as_str()).collect();
                assert_eq!(ids, vec!["abc-node-1", "abc-node-2"]);
            }
            other => panic!("expected task failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_all_outlives_a_failed_control_body() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let dir = tempfile::tempdir().unwrap();
        let script = format!("sleep 0.5; touch {}/done-$FANJOIN_SPLIT_INDEX", dir.path().display());
        let mut config = fast_config(2);
        config.sibling_failure_policy = SiblingFailurePolicy::WaitAll;

        let step = ParallelStep::new(Role::Control, task("control-abc", 0), config, store)
            .with_invocation(StepInvocation::new("sh", ["-c", script.as_str()]));

        let err = step.run(&FailingBody).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StepFailed { .. }));
        assert!(dir.path().join("done-1").exists());
    }
}
