use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::rendezvous::RendezvousFacts;

/// Translates rendezvous facts into the configuration vocabulary of a
/// numerical framework. Adapters never take part in the framework's protocol.
pub trait FrameworkAdapter: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn environment(&self, facts: &RendezvousFacts) -> Vec<(String, String)>;
}

/// Settings for the adapters the binary knows how to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameworkConfig {
    TorchDistributed {
        #[serde(default)]
        master_port: Option<u16>,
        /// Process-group backend, `gloo` unless set.
        #[serde(default)]
        process_group_backend: Option<String>,
    },
}

impl FrameworkConfig {
    pub fn build(&self, run_id: &str) -> Box<dyn FrameworkAdapter> {
        match self {
            FrameworkConfig::TorchDistributed {
                master_port,
                process_group_backend,
            } => {
                let mut adapter = TorchDistributedAdapter::new(run_id, *master_port);
                if let Some(backend) = process_group_backend {
                    adapter = adapter.with_process_group_backend(backend.clone());
                }
                Box::new(adapter)
            }
        }
    }
}

/// `MASTER_ADDR`-style variables for process-group initialisation.
#[derive(Debug, Clone)]
pub struct TorchDistributedAdapter {
    master_port: u16,
    process_group_backend: String,
}

impl TorchDistributedAdapter {
    const PORT_BASE: u16 = 51000;
    const PORT_SPAN: u64 = 10000;
    const DEFAULT_BACKEND: &'static str = "gloo";

    /// Without an explicit port one is derived from the run id, so concurrent
    /// runs on shared hosts rarely collide.
    pub fn new(run_id: &str, master_port: Option<u16>) -> Self {
        let master_port = master_port.unwrap_or_else(|| Self::port_for_run(run_id));
        Self {
            master_port,
            process_group_backend: Self::DEFAULT_BACKEND.to_string(),
        }
    }

    pub fn with_process_group_backend(mut self, backend: impl Into<String>) -> Self {
        self.process_group_backend = backend.into();
        self
    }

    pub fn master_port(&self) -> u16 {
        self.master_port
    }

    pub fn process_group_backend(&self) -> &str {
        &self.process_group_backend
    }

    fn port_for_run(run_id: &str) -> u16 {
        let seed = match run_id.parse::<i64>() {
            Ok(n) => n.unsigned_abs(),
            Err(_) => run_id
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64)),
        };
        Self::PORT_BASE + (seed % Self::PORT_SPAN) as u16
    }
}

impl FrameworkAdapter for TorchDistributedAdapter {
    fn name(&self) -> &str {
        "torch_distributed"
    }

    fn environment(&self, facts: &RendezvousFacts) -> Vec<(String, String)> {
        vec![
            ("MASTER_ADDR".to_string(), facts.main_node_address.clone()),
            ("MASTER_PORT".to_string(), self.master_port.to_string()),
            ("NODE_RANK".to_string(), facts.node_index.to_string()),
            ("WORLD_SIZE".to_string(), facts.world_size.to_string()),
            ("NUM_NODES".to_string(), facts.num_nodes.to_string()),
            (
                "PL_TORCH_DISTRIBUTED_BACKEND".to_string(),
                self.process_group_backend.clone(),
            ),
        ]
    }
}
