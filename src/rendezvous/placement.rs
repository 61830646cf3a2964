//! Placement Context sources.
//!
//! Whatever scheduled this instance knows how many nodes were granted and
//! which one this is. These types read those facts without interpreting them.

use std::path::PathBuf;

use crate::error::{CoordinatorError, Result};

/// Loopback used for rendezvous when every instance shares one host.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

pub const ENV_NUM_NODES: &str = "FANJOIN_NUM_NODES";
pub const ENV_NODE_INDEX: &str = "FANJOIN_NODE_INDEX";
pub const ENV_MAIN_ADDR: &str = "FANJOIN_MAIN_ADDR";
pub const ENV_WORLD_SIZE: &str = "FANJOIN_WORLD_SIZE";
pub const ENV_LOCAL_WORKERS: &str = "FANJOIN_LOCAL_WORKERS";

pub const DEFAULT_KUBERNETES_MAIN_HOST_FILE: &str = "/etc/volcano/m.host";

/// Read-only facts about where this instance was placed.
pub trait PlacementContext: Send + Sync {
    fn num_nodes(&self) -> usize;
    fn node_index(&self) -> usize;
    /// Address of node 0 as propagated by the backend, if it propagated one.
    fn main_node_address(&self) -> Option<String>;
}

/// Placement with explicit values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPlacement {
    pub num_nodes: usize,
    pub node_index: usize,
    pub main_node_address: Option<String>,
}

impl StaticPlacement {
    pub fn new(num_nodes: usize, node_index: usize, main_node_address: Option<String>) -> Self {
        Self {
            num_nodes,
            node_index,
            main_node_address,
        }
    }

    /// All `width` instances on this host, rendezvousing over loopback.
    pub fn single_host(width: usize, node_index: usize) -> Self {
        Self::new(width, node_index, Some(LOOPBACK_ADDRESS.to_string()))
    }
}

impl PlacementContext for StaticPlacement {
    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn node_index(&self) -> usize {
        self.node_index
    }

    fn main_node_address(&self) -> Option<String> {
        self.main_node_address.clone()
    }
}

/// Environment vocabularies the backends use to describe placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementSource {
    /// `FANJOIN_*` variables injected by the local backend.
    Local,
    /// Multi-node parallel batch jobs.
    Batch,
    /// Gang-scheduled pods; the main host is written to a file.
    Kubernetes { main_host_file: PathBuf },
}

impl PlacementSource {
    pub fn kubernetes() -> Self {
        PlacementSource::Kubernetes {
            main_host_file: PathBuf::from(DEFAULT_KUBERNETES_MAIN_HOST_FILE),
        }
    }
}

/// Placement read once from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPlacement {
    source: PlacementSource,
    placement: StaticPlacement,
}

impl EnvPlacement {
    pub fn from_env(source: PlacementSource) -> Result<Self> {
        Self::from_lookup(source, |key| std::env::var(key).ok())
    }

    /// Reads placement through `lookup` instead of the process environment.
    pub fn from_lookup<F>(source: PlacementSource, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let placement = match &source {
            PlacementSource::Local => StaticPlacement::new(
                parse_or(&lookup, ENV_NUM_NODES, 1)?,
                parse_or(&lookup, ENV_NODE_INDEX, 0)?,
                non_empty(lookup(ENV_MAIN_ADDR)),
            ),
            PlacementSource::Batch => {
                let num_nodes = parse_or(&lookup, "AWS_BATCH_JOB_NUM_NODES", 1)?;
                let node_index = parse_or(&lookup, "AWS_BATCH_JOB_NODE_INDEX", 0)?;
                let main_index = parse_or(&lookup, "AWS_BATCH_JOB_MAIN_NODE_INDEX", 0)?;
                // Offset 0 is the control instance, so it must be the main node.
                if main_index != 0 {
                    return Err(CoordinatorError::RendezvousUnavailable(format!(
                        "main node index is {}, expected 0",
                        main_index
                    )));
                }
                StaticPlacement::new(
                    num_nodes,
                    node_index,
                    non_empty(lookup("AWS_BATCH_JOB_MAIN_NODE_PRIVATE_IPV4_ADDRESS")),
                )
            }
            PlacementSource::Kubernetes { main_host_file } => {
                let num_nodes = parse_or(&lookup, "MF_KUBERNETES_NUM_PARALLEL", 1)?;
                let task_index: usize = parse_or(&lookup, "VK_TASK_INDEX", 0)?;
                // Secondary pods are indexed from zero within their own task group.
                let node_index = match lookup("MF_KUBERNETES_ROLE").as_deref() {
                    Some("secondary") => task_index + 1,
                    _ => task_index,
                };
                let main = std::fs::read_to_string(main_host_file)
                    .ok()
                    .map(|s| s.trim().to_string());
                StaticPlacement::new(num_nodes, node_index, non_empty(main))
            }
        };

        Ok(Self { source, placement })
    }

    pub fn source(&self) -> &PlacementSource {
        &self.source
    }
}

impl PlacementContext for EnvPlacement {
    fn num_nodes(&self) -> usize {
        self.placement.num_nodes
    }

    fn node_index(&self) -> usize {
        self.placement.node_index
    }

    fn main_node_address(&self) -> Option<String> {
        self.placement.main_node_address.clone()
    }
}

fn parse_or<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw.parse().map_err(|_| {
            CoordinatorError::RendezvousUnavailable(format!("{} is not a valid index: {:?}", key, raw))
        }),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
