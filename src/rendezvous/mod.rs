//! Rendezvous Model.
//!
//! Derives node index, global ranks, world size and the main node's address
//! from a [`PlacementContext`]. Every instance computes these independently,
//! so nothing here may depend on anything but its inputs.

pub mod framework;
pub mod placement;

use std::net::{IpAddr, ToSocketAddrs};
use std::ops::Range;

use anyhow::{Context as AnyhowContext, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordinatorError, Result};
use placement::{
    ENV_LOCAL_WORKERS, ENV_MAIN_ADDR, ENV_NODE_INDEX, ENV_NUM_NODES, ENV_WORLD_SIZE,
    LOOPBACK_ADDRESS, PlacementContext,
};

/// Total number of workers that rendezvous.
pub fn world_size(num_nodes: usize, local_workers_per_node: usize) -> usize {
    num_nodes * local_workers_per_node
}

/// Rank of local worker `local_rank` on node `node_index`. Local ranks run
/// from 0 to `local_workers_per_node - 1`.
pub fn global_rank(
    node_index: usize,
    local_rank: usize,
    local_workers_per_node: usize,
) -> Result<usize> {
    if local_rank >= local_workers_per_node {
        return Err(CoordinatorError::Config(format!(
            "local rank {} out of range for {} worker(s) per node",
            local_rank, local_workers_per_node
        )));
    }
    Ok(node_index * local_workers_per_node + local_rank)
}

/// Rendezvous facts for one instance. Computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousFacts {
    pub num_nodes: usize,
    pub local_workers_per_node: usize,
    pub world_size: usize,
    pub node_index: usize,
    pub global_rank_base: usize,
    pub main_node_address: String,
}

impl RendezvousFacts {
    pub fn global_rank(&self, local_rank: usize) -> Result<usize> {
        global_rank(self.node_index, local_rank, self.local_workers_per_node)
    }

    /// Global ranks owned by this node's local workers.
    pub fn ranks(&self) -> Range<usize> {
        self.global_rank_base..self.global_rank_base + self.local_workers_per_node
    }

    pub fn is_main_node(&self) -> bool {
        self.node_index == 0
    }

    /// The stable record exposed to framework adapters and child processes.
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![
            (ENV_NODE_INDEX.to_string(), self.node_index.to_string()),
            (ENV_NUM_NODES.to_string(), self.num_nodes.to_string()),
            (ENV_WORLD_SIZE.to_string(), self.world_size.to_string()),
            (ENV_MAIN_ADDR.to_string(), self.main_node_address.clone()),
            (
                ENV_LOCAL_WORKERS.to_string(),
                self.local_workers_per_node.to_string(),
            ),
        ]
    }
}

/// How node 0 finds an address its peers can reach.
pub trait AddressResolver: Send + Sync {
    fn local_address(&self) -> anyhow::Result<String>;
}

/// Resolves this host's name and prefers a non-loopback IPv4 address.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostnameResolver;

impl AddressResolver for HostnameResolver {
    fn local_address(&self) -> anyhow::Result<String> {
        let host = hostname::get().context("Failed to read host name")?;
        let host = host.to_string_lossy().into_owned();
        let addrs: Vec<IpAddr> = (host.as_str(), 0)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve host {}", host))?
            .map(|a| a.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4() && !ip.is_loopback())
            .or_else(|| addrs.iter().find(|ip| ip.is_ipv4()))
            .or_else(|| addrs.first())
            .map(|ip| ip.to_string())
            .ok_or_else(|| anyhow!("Host {} has no addresses", host))
    }
}

/// Always answers loopback. For fan-outs confined to one host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackResolver;

impl AddressResolver for LoopbackResolver {
    fn local_address(&self) -> anyhow::Result<String> {
        Ok(LOOPBACK_ADDRESS.to_string())
    }
}

/// Rendezvous computations over one placement.
pub struct RendezvousModel<'a> {
    placement: &'a dyn PlacementContext,
    resolver: &'a dyn AddressResolver,
}

impl<'a> RendezvousModel<'a> {
    pub fn new(placement: &'a dyn PlacementContext, resolver: &'a dyn AddressResolver) -> Self {
        Self {
            placement,
            resolver,
        }
    }

    pub fn node_count(&self) -> usize {
        self.placement.num_nodes()
    }

    pub fn node_index(&self) -> usize {
        self.placement.node_index()
    }

    pub fn world_size(&self, local_workers_per_node: usize) -> usize {
        world_size(self.node_count(), local_workers_per_node)
    }

    pub fn global_rank(&self, local_rank: usize, local_workers_per_node: usize) -> Result<usize> {
        global_rank(self.node_index(), local_rank, local_workers_per_node)
    }

    /// Address of node 0.
    ///
    /// Single-node runs get loopback without consulting anything. Otherwise
    /// node 0 resolves itself and the rest rely on the placement; a missing
    /// value there means the backend never propagated it and is fatal.
    pub fn main_node_address(&self) -> Result<String> {
        if self.node_count() == 1 {
            return Ok(LOOPBACK_ADDRESS.to_string());
        }

        if self.node_index() == 0 {
            return self.resolver.local_address().map_err(|e| {
                CoordinatorError::RendezvousUnavailable(format!(
                    "main node could not resolve its own address: {:#}",
                    e
                ))
            });
        }

        self.placement.main_node_address().ok_or_else(|| {
            CoordinatorError::RendezvousUnavailable(format!(
                "node {} of {} was not given the main node address",
                self.node_index(),
                self.node_count()
            ))
        })
    }

    pub fn facts(&self, local_workers_per_node: usize) -> Result<RendezvousFacts> {
        let num_nodes = self.node_count();
        let node_index = self.node_index();
        if num_nodes == 0 || node_index >= num_nodes {
            return Err(CoordinatorError::RendezvousUnavailable(format!(
                "node index {} is outside a placement of {} node(s)",
                node_index, num_nodes
            )));
        }
        if local_workers_per_node == 0 {
            return Err(CoordinatorError::Config(
                "local_workers_per_node must be at least 1".to_string(),
            ));
        }

        let facts = RendezvousFacts {
            num_nodes,
            local_workers_per_node,
            world_size: world_size(num_nodes, local_workers_per_node),
            node_index,
            global_rank_base: node_index * local_workers_per_node,
            main_node_address: self.main_node_address()?,
        };
        debug!(
            node_index = facts.node_index,
            num_nodes = facts.num_nodes,
            world_size = facts.world_size,
            main = %facts.main_node_address,
            "Computed rendezvous facts"
        );
        Ok(facts)
    }
}
