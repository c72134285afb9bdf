//! # memory transport
//!
//! why: run whole clusters in one process with scripted network failures
//! relations: routes RaftTransport calls straight into registered NodeHandles
//! what: InMemoryNetwork (register, deregister, partition, isolate, heal), InMemoryTransport

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use kvraft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use tracing::info;

use super::RaftTransport;
use crate::error::TransportError;
use crate::runtime::NodeHandle;

#[derive(Default)]
struct NetworkState {
    /// Running nodes, by id.
    nodes: HashMap<NodeId, NodeHandle>,
    /// Every id ever registered, so a partition also covers stopped nodes.
    known: BTreeSet<NodeId>,
    /// Group per node while partitioned; `None` when the network is whole.
    groups: Option<HashMap<NodeId, usize>>,
}

/// Shared routing table for every node in one process.
///
/// Cheap to clone; all clones see the same partitions.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for the node `from`. Can be created before the node is registered.
    pub fn transport(&self, from: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            from,
            network: self.clone(),
        })
    }

    /// Make a running node reachable.
    pub fn register(&self, handle: NodeHandle) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.known.insert(handle.id());
        state.nodes.insert(handle.id(), handle);
    }

    /// Take a node off the network, e.g. to simulate a crash.
    pub fn deregister(&self, id: NodeId) -> Option<NodeHandle> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.nodes.remove(&id)
    }

    /// Split the cluster; nodes only reach members of their own group.
    /// Nodes missing from every group end up alone.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut assignment = HashMap::new();
        for (group, members) in groups.iter().enumerate() {
            for id in members.iter() {
                assignment.insert(*id, group);
            }
        }
        let mut next = groups.len();
        let known: Vec<NodeId> = state.known.iter().copied().collect();
        for id in known {
            assignment.entry(id).or_insert_with(|| {
                next += 1;
                next - 1
            });
        }
        info!(?groups, "network partitioned");
        state.groups = Some(assignment);
    }

    /// Cut one node off from everyone else, keeping any existing split.
    pub fn isolate(&self, id: NodeId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut groups = state.groups.take().unwrap_or_default();
        for known in state.known.iter() {
            groups.entry(*known).or_insert(0);
        }
        let lonely = groups.values().max().map_or(0, |max| max + 1);
        groups.insert(id, lonely);
        info!(node = id, "node isolated");
        state.groups = Some(groups);
    }

    /// Restore full connectivity.
    pub fn heal(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.groups = None;
        info!("network healed");
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.groups {
            None => true,
            Some(groups) => match (groups.get(&from), groups.get(&to)) {
                (Some(a), Some(b)) => a == b,
                // registered after the split: unreachable until healed
                _ => false,
            },
        }
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<NodeHandle, TransportError> {
        if !self.can_reach(from, to) {
            return Err(TransportError::Unreachable { from, to });
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownPeer(to))
    }
}

/// One node's view of an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let peer = self.network.route(self.from, target)?;
        let response = peer
            .request_vote(request)
            .await
            .map_err(|err| TransportError::Remote {
                peer: target,
                reason: err.to_string(),
            })?;
        // the reply crosses the network too
        if !self.network.can_reach(target, self.from) {
            return Err(TransportError::Unreachable {
                from: target,
                to: self.from,
            });
        }
        Ok(response)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let peer = self.network.route(self.from, target)?;
        let response = peer
            .append_entries(request)
            .await
            .map_err(|err| TransportError::Remote {
                peer: target,
                reason: err.to_string(),
            })?;
        if !self.network.can_reach(target, self.from) {
            return Err(TransportError::Unreachable {
                from: target,
                to: self.from,
            });
        }
        Ok(response)
    }
}
