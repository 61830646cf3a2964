use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};
use crate::launch::SiblingFailurePolicy;
use crate::rendezvous::framework::FrameworkConfig;

pub const DEFAULT_JOIN_TIMEOUT_SECONDS: u64 = 600;
pub const DEFAULT_JOIN_POLL_INTERVAL_SECONDS: u64 = 2;

/// Settings for one parallel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub fanout_width: usize,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub join_poll_interval_seconds: u64,
    #[serde(default = "default_local_workers")]
    pub local_workers_per_node: usize,
    #[serde(default)]
    pub sibling_failure_policy: SiblingFailurePolicy,
    #[serde(default)]
    pub framework: Option<FrameworkConfig>,
}

fn default_join_timeout() -> u64 {
    DEFAULT_JOIN_TIMEOUT_SECONDS
}

fn default_poll_interval() -> u64 {
    DEFAULT_JOIN_POLL_INTERVAL_SECONDS
}

fn default_local_workers() -> usize {
    1
}

impl FanoutConfig {
    pub fn new(fanout_width: usize) -> Self {
        Self {
            fanout_width,
            join_timeout_seconds: DEFAULT_JOIN_TIMEOUT_SECONDS,
            join_poll_interval_seconds: DEFAULT_JOIN_POLL_INTERVAL_SECONDS,
            local_workers_per_node: 1,
            sibling_failure_policy: SiblingFailurePolicy::default(),
            framework: None,
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: FanoutConfig = serde_yaml::from_str(content)
            .map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fanout_width < 1 {
            return Err(CoordinatorError::InvalidFanout {
                width: self.fanout_width,
            });
        }
        if self.local_workers_per_node < 1 {
            return Err(CoordinatorError::Config(
                "local_workers_per_node must be at least 1".to_string(),
            ));
        }
        if self.join_poll_interval_seconds == 0 {
            return Err(CoordinatorError::Config(
                "join_poll_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.join_poll_interval_seconds > self.join_timeout_seconds {
            return Err(CoordinatorError::Config(format!(
                "join_poll_interval_seconds ({}) exceeds join_timeout_seconds ({})",
                self.join_poll_interval_seconds, self.join_timeout_seconds
            )));
        }
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_secs(self.join_poll_interval_seconds)
    }
}
