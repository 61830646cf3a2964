use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fanjoin::config::FanoutConfig;
use fanjoin::coordinator::planner;
use fanjoin::coordinator::{CommandStep, ParallelStep, Role, StepReport};
use fanjoin::launch::local::LocalProcessBackend;
use fanjoin::launch::platform::PlatformBackend;
use fanjoin::launch::{
    ENV_RUN_ID, ENV_SPLIT_INDEX, ENV_STEP_NAME, ENV_TASK_ID, LaunchBackend,
    SiblingFailurePolicy, StepInvocation,
};
use fanjoin::rendezvous::placement::{
    ENV_LOCAL_WORKERS, ENV_NUM_NODES, EnvPlacement, PlacementSource,
};
use fanjoin::runtime::cancel::{CancelSignal, cancel_pair};
use fanjoin::runtime::context::StoreContext;
use fanjoin::runtime::file_storage::FileStateStore;
use fanjoin::runtime::identity::{RunStepIdentity, TaskIdentity};
use fanjoin::runtime::redis_storage::RedisStateStore;
use fanjoin::runtime::storage::StateStore;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control instance of a parallel step: plan, launch, join
    Control {
        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        store: StoreArgs,

        /// YAML file with the fan-out settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of instances (overrides the config file)
        #[arg(long)]
        width: Option<usize>,

        /// Seconds to wait for siblings before failing the step
        #[arg(long)]
        join_timeout: Option<u64>,

        /// Seconds between polls of sibling outcomes
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Workers per node, used for rank and world-size computation
        #[arg(long)]
        workers_per_node: Option<usize>,

        /// Let healthy siblings run to completion after one fails
        #[arg(long)]
        wait_all: bool,

        /// Where siblings run
        #[arg(long, value_enum, default_value_t = BackendKind::Local)]
        backend: BackendKind,

        /// Placement vocabulary, for platform backends
        #[arg(long, value_enum, default_value_t = PlacementKind::Batch)]
        placement: PlacementKind,

        /// Step body command, after `--`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Run a worker instance of a parallel step
    Worker {
        #[command(flatten)]
        identity: IdentityArgs,

        #[command(flatten)]
        store: StoreArgs,

        /// Number of instances in the fan-out
        #[arg(long, env = ENV_NUM_NODES)]
        width: usize,

        #[arg(long, env = ENV_LOCAL_WORKERS, default_value_t = 1)]
        workers_per_node: usize,

        /// Placement vocabulary; `local` reads what the local backend injected
        #[arg(long, value_enum, default_value_t = PlacementKind::Local)]
        placement: PlacementKind,

        /// Step body command, after `--`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Print a published roster and the outcomes recorded for it
    Inspect {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        run_id: String,

        #[arg(long = "step")]
        step_name: String,

        /// Task id of the control instance
        #[arg(long)]
        control_task_id: String,
    },
}

#[derive(Args, Clone)]
struct IdentityArgs {
    #[arg(long, env = ENV_RUN_ID)]
    run_id: String,

    #[arg(long = "step", env = ENV_STEP_NAME)]
    step_name: String,

    #[arg(long, env = ENV_TASK_ID)]
    task_id: String,

    #[arg(long, env = ENV_SPLIT_INDEX, default_value_t = 0)]
    split_index: usize,
}

impl IdentityArgs {
    fn identity(&self) -> TaskIdentity {
        let run_step = RunStepIdentity::new(self.run_id.clone(), self.step_name.clone());
        TaskIdentity::new(&run_step, self.task_id.clone(), self.split_index)
    }
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// Directory shared by every instance on this host
    #[arg(long, env = "FANJOIN_STORE_DIR", conflicts_with = "redis")]
    store_dir: Option<PathBuf>,

    /// Redis connection URL, for instances on different hosts
    #[arg(long, env = "FANJOIN_REDIS")]
    redis: Option<String>,
}

impl StoreArgs {
    async fn open(&self) -> Result<Arc<dyn StateStore>> {
        match (&self.store_dir, &self.redis) {
            (Some(dir), _) => Ok(Arc::new(FileStateStore::open(dir).await?)),
            (None, Some(url)) => {
                let client = redis::Client::open(url.as_str()).context("Invalid Redis URL")?;
                Ok(Arc::new(RedisStateStore::new(client)))
            }
            (None, None) => bail!("either --store-dir or --redis is required"),
        }
    }

    /// The same store, as arguments for a sibling's `worker` invocation.
    fn to_args(&self) -> Result<Vec<String>> {
        match (&self.store_dir, &self.redis) {
            (Some(dir), _) => {
                let dir = std::path::absolute(dir)
                    .with_context(|| format!("Failed to resolve {}", dir.display()))?;
                Ok(vec!["--store-dir".to_string(), dir.display().to_string()])
            }
            (None, Some(url)) => Ok(vec!["--redis".to_string(), url.clone()]),
            (None, None) => bail!("either --store-dir or --redis is required"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Child processes on this host
    Local,
    /// The platform already started every instance
    Platform,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PlacementKind {
    Local,
    Batch,
    Kubernetes,
}

impl PlacementKind {
    fn source(self) -> PlacementSource {
        match self {
            PlacementKind::Local => PlacementSource::Local,
            PlacementKind::Batch => PlacementSource::Batch,
            PlacementKind::Kubernetes => PlacementSource::kubernetes(),
        }
    }
}

fn step_invocation(command: &[String]) -> Result<StepInvocation> {
    let (program, args) = command
        .split_first()
        .context("a step command is required after `--`")?;
    Ok(StepInvocation::new(program.clone(), args.iter().cloned()))
}

/// Cancels on Ctrl-C so joins and sibling waits stop promptly.
fn cancel_on_ctrl_c() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            handle.cancel();
        }
    });
    signal
}

fn finish(result: fanjoin::Result<StepReport>) -> Result<()> {
    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            for task in e.implicated_tasks() {
                error!(task = %task, "Implicated task");
            }
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Control {
            identity,
            store,
            config,
            width,
            join_timeout,
            poll_interval,
            workers_per_node,
            wait_all,
            backend,
            placement,
            command,
        } => {
            let mut fanout = match (&config, width) {
                (Some(path), _) => FanoutConfig::from_yaml_file(path)?,
                (None, Some(width)) => FanoutConfig::new(width),
                (None, None) => bail!("either --config or --width is required"),
            };
            if let Some(width) = width {
                fanout.fanout_width = width;
            }
            if let Some(secs) = join_timeout {
                fanout.join_timeout_seconds = secs;
            }
            if let Some(secs) = poll_interval {
                fanout.join_poll_interval_seconds = secs;
            }
            if let Some(n) = workers_per_node {
                fanout.local_workers_per_node = n;
            }
            if wait_all {
                fanout.sibling_failure_policy = SiblingFailurePolicy::WaitAll;
            }
            fanout.validate()?;

            let body = CommandStep::new(step_invocation(&command)?);
            let state = store.open().await?;
            let launcher: Arc<dyn LaunchBackend> = match backend {
                BackendKind::Local => Arc::new(LocalProcessBackend::new()),
                BackendKind::Platform => Arc::new(PlatformBackend::new("platform")),
            };

            let mut step = ParallelStep::new(Role::Control, identity.identity(), fanout.clone(), state)
                .with_backend(launcher)
                .with_cancel(cancel_on_ctrl_c());

            match backend {
                BackendKind::Local => {
                    // Siblings re-enter this binary as workers; identity and
                    // rendezvous facts arrive through their environment.
                    let exe = std::env::current_exe().context("Failed to locate own executable")?;
                    let mut args = vec!["worker".to_string()];
                    args.extend(store.to_args()?);
                    args.push("--".to_string());
                    args.extend(command.iter().cloned());
                    step = step.with_invocation(StepInvocation::new(exe.display().to_string(), args));
                }
                BackendKind::Platform => {
                    step = step.with_placement(Arc::new(EnvPlacement::from_env(placement.source())?));
                }
            }

            info!(task = %step.identity(), width = fanout.fanout_width, "Starting control instance");
            finish(step.run(&body).await)
        }
        Commands::Worker {
            identity,
            store,
            width,
            workers_per_node,
            placement,
            command,
        } => {
            let mut fanout = FanoutConfig::new(width);
            fanout.local_workers_per_node = workers_per_node;

            let body = CommandStep::new(step_invocation(&command)?);
            let state = store.open().await?;
            let step = ParallelStep::new(Role::Worker, identity.identity(), fanout, state)
                .with_placement(Arc::new(EnvPlacement::from_env(placement.source())?))
                .with_cancel(cancel_on_ctrl_c());

            info!(task = %step.identity(), "Starting worker instance");
            finish(step.run(&body).await)
        }
        Commands::Inspect {
            store,
            run_id,
            step_name,
            control_task_id,
        } => {
            let state = store.open().await?;
            let ctx = StoreContext::new(RunStepIdentity::new(run_id, step_name), state);
            let Some(roster) = ctx.read_roster(&control_task_id).await? else {
                bail!("no roster published for control task {}", control_task_id);
            };

            let mut outcomes = Vec::with_capacity(roster.width());
            for task in roster.entries() {
                let outcome = ctx.read_outcome(task).await?;
                outcomes.push(json!({ "task": task, "outcome": outcome }));
            }
            let expected = planner::expected_task_ids(&control_task_id, roster.width())?;
            let missing = roster.missing(expected.iter().map(String::as_str));

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "roster": roster,
                    "outcomes": outcomes,
                    "naming_mismatches": missing,
                }))?
            );
            Ok(())
        }
    }
}
