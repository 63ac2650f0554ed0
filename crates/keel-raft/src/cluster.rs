//! Cluster membership view and peer discovery.

use crate::error::Result;
use crate::types::Endpoint;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Static view of cluster membership: the local endpoint plus its peers.
///
/// The peer list excludes the local endpoint. Membership is fixed for the
/// lifetime of an election round; `update_nodes` swaps in a new list
/// between rounds.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: Endpoint,
    peers: Vec<Endpoint>,
}

impl ClusterView {
    pub fn new(local: Endpoint, nodes: Vec<Endpoint>) -> Self {
        let mut view = Self {
            local,
            peers: Vec::new(),
        };
        view.set_nodes(nodes);
        view
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn peers(&self) -> &[Endpoint] {
        &self.peers
    }

    /// Replace the membership list. The local endpoint is filtered out and
    /// duplicates are dropped.
    pub fn set_nodes(&mut self, nodes: Vec<Endpoint>) {
        let mut peers: Vec<Endpoint> = nodes.into_iter().filter(|n| *n != self.local).collect();
        peers.sort();
        peers.dedup();
        self.peers = peers;
    }

    /// Acknowledgments required to commit, counting the leader's own
    /// implicit ack: `max(2, floor((N + 1) / 2))` where N is the peer count.
    pub fn quorum(&self) -> usize {
        ((self.peers.len() + 1) / 2).max(2)
    }
}

/// Peer discovery.
///
/// The discovery mechanism that enumerates cluster endpoints is an
/// external collaborator; the core only registers itself and re-reads the
/// node list on demand.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Register the local endpoint with the discovery backend.
    async fn register(&self, local: &Endpoint) -> Result<()>;

    /// Enumerate all known cluster endpoints (including the local one).
    async fn nodes(&self) -> Result<Vec<Endpoint>>;
}

/// Discovery over a shared in-process registry.
///
/// Nodes in the same process register themselves and see each other;
/// useful for tests and single-binary clusters.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    nodes: RwLock<Vec<Endpoint>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry with a fixed node list.
    pub fn with_nodes(nodes: Vec<Endpoint>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn register(&self, local: &Endpoint) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains(local) {
            nodes.push(local.clone());
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<Endpoint>> {
        Ok(self.nodes.read().clone())
    }
}
