pub mod monitor;
pub mod planner;
pub mod role;
pub mod step;

pub use monitor::{JoinMonitor, JoinOutcome};
pub use planner::{JoinRoster, plan};
pub use role::{ParallelStep, Phase, Role, StepReport};
pub use step::{CommandStep, StepBody, StepContext};
