//! # transport
//!
//! why: keep the event loop off the network; peer workers call a RaftTransport
//!      and feed each response back into the loop as an event
//! relations: used by runtime.rs peer workers, implemented by memory.rs and http.rs
//! what: RaftTransport trait; InMemoryNetwork routes calls in one process and can
//!       partition, isolate and heal nodes; HttpTransport posts JSON to each peer's raft_router

mod http;
mod memory;

pub use http::{raft_router, HttpTransport};
pub use memory::{InMemoryNetwork, InMemoryTransport};

use async_trait::async_trait;
use kvraft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};

use crate::error::TransportError;

/// Delivers RPCs to a peer and returns its answer.
///
/// Timeouts are applied by the caller, so implementations may block for as
/// long as the underlying network does.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
