//! # runtime
//!
//! why: run one RaftNode as an async service without ever sharing its state
//! relations: drives kvraft-core through Ready batches, persists via kvraft-storage,
//!            talks to peers through a RaftTransport
//! what: spawn_node, NodeHandle (client + inbound rpc api), event loop, peer workers
//!
//! Every state change happens on a single event-loop task that owns the
//! RaftNode, the storage and the cache. Timer ticks, inbound RPCs, client
//! writes and peer responses all arrive on one channel and are handled one
//! at a time. After each step the loop persists the Ready batch, then hands
//! outbound messages to per-peer workers, then applies newly committed
//! entries. RPC replies leave only after the step they depend on is durable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvraft_core::{
    AppendEntriesRequest, AppendEntriesResponse, CacheStateMachine, CacheStats, Clock, Command,
    LogIndex, NodeId, RaftError, RaftMessage, RaftNode, RaftStatus, RequestVoteRequest,
    RequestVoteResponse, Term,
};
use kvraft_storage::Storage;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::transport::RaftTransport;

const EVENT_QUEUE_DEPTH: usize = 1024;

enum Event {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Proposal, NodeError>>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Keys {
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    RequestVote {
        request: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    VoteResult {
        from: NodeId,
        response: RequestVoteResponse,
    },
    AppendResult {
        from: NodeId,
        response: AppendEntriesResponse,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// A write accepted into the leader's log, not yet committed.
struct Proposal {
    index: LogIndex,
    applied: oneshot::Receiver<Result<LogIndex, NodeError>>,
}

/// Client waiting for its entry to be applied.
struct Waiter {
    term: Term,
    reply: oneshot::Sender<Result<LogIndex, NodeError>>,
}

/// RPC answer held back until the step that produced it is persisted.
enum DeferredReply {
    Vote(oneshot::Sender<RequestVoteResponse>, RequestVoteResponse),
    Append(oneshot::Sender<AppendEntriesResponse>, AppendEntriesResponse),
}

impl DeferredReply {
    fn send(self) {
        // the caller may have timed out already
        match self {
            Self::Vote(tx, response) => {
                let _ = tx.send(response);
            }
            Self::Append(tx, response) => {
                let _ = tx.send(response);
            }
        }
    }
}

/// Client and peer-facing handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    commit_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Replicate `command` and wait until it is applied on this node.
    ///
    /// Fails with `NotLeader` on followers, and with `QuorumUnavailable` when
    /// no majority stores the entry within the commit timeout. In the latter
    /// case the entry stays in the log and may still commit later.
    pub async fn submit(&self, command: Command) -> Result<LogIndex, NodeError> {
        let proposal = self
            .call(|reply| Event::Submit { command, reply })
            .await??;
        match time::timeout(self.commit_timeout, proposal.applied).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::Stopped(self.id)),
            Err(_) => Err(RaftError::QuorumUnavailable {
                index: proposal.index,
                waited_ms: self.commit_timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<LogIndex, NodeError> {
        self.submit(Command::set(key, value)).await
    }

    pub async fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        ttl_secs: u64,
    ) -> Result<LogIndex, NodeError> {
        self.submit(Command::set_with_ttl(key, value, ttl_secs)).await
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<LogIndex, NodeError> {
        self.submit(Command::delete(key)).await
    }

    pub async fn clear(&self) -> Result<LogIndex, NodeError> {
        self.submit(Command::Clear).await
    }

    /// Local read; may be stale on a follower.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Value>, NodeError> {
        let key = key.into();
        self.call(|reply| Event::Get { key, reply }).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, NodeError> {
        self.call(|reply| Event::Keys { reply }).await
    }

    pub async fn stats(&self) -> Result<CacheStats, NodeError> {
        self.call(|reply| Event::Stats { reply }).await
    }

    pub async fn status(&self) -> Result<RaftStatus, NodeError> {
        self.call(|reply| Event::Status { reply }).await
    }

    /// Inbound RequestVote from a peer.
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, NodeError> {
        self.call(|reply| Event::RequestVote { request, reply }).await
    }

    /// Inbound AppendEntries from a peer.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NodeError> {
        self.call(|reply| Event::AppendEntries { request, reply }).await
    }

    /// Stop the event loop and wait for it to release its storage.
    pub async fn shutdown(&self) {
        let (done, stopped) = oneshot::channel();
        if self.events.send(Event::Shutdown { done }).await.is_ok() {
            let _ = stopped.await;
        }
    }

    async fn call<R>(&self, event: impl FnOnce(oneshot::Sender<R>) -> Event) -> Result<R, NodeError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(event(reply))
            .await
            .map_err(|_| NodeError::Stopped(self.id))?;
        response.await.map_err(|_| NodeError::Stopped(self.id))
    }
}

/// Start a node: restore persisted state, then spawn its event loop and one
/// replication worker per peer. Must be called inside a tokio runtime.
pub fn spawn_node<S, T>(
    config: NodeConfig,
    storage: S,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
) -> Result<NodeHandle, NodeError>
where
    S: Storage + 'static,
    T: RaftTransport,
{
    config.validate()?;
    let persisted = storage.load_state()?;
    let raft = RaftNode::restore(config.id, config.members.clone(), config.raft.clone(), persisted)?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let mut peers = HashMap::new();
    for peer in config.peers() {
        let (tx, rx) = mpsc::channel(config.peer_queue_depth);
        peers.insert(peer, tx);
        tokio::spawn(peer_worker(
            peer,
            Arc::clone(&transport),
            rx,
            events_tx.clone(),
            config.rpc_timeout(),
        ));
    }

    let event_loop = EventLoop {
        raft,
        storage,
        cache: CacheStateMachine::new(clock),
        peers,
        waiters: HashMap::new(),
        started: Instant::now(),
    };
    tokio::spawn(event_loop.run(events_rx, config.tick_interval()));
    info!(node = config.id, members = ?config.members, "node started");

    Ok(NodeHandle {
        id: config.id,
        events: events_tx,
        commit_timeout: config.commit_timeout(),
    })
}

struct EventLoop<S> {
    raft: RaftNode,
    storage: S,
    cache: CacheStateMachine,
    peers: HashMap<NodeId, mpsc::Sender<RaftMessage>>,
    waiters: HashMap<LogIndex, Waiter>,
    started: Instant,
}

impl<S: Storage> EventLoop<S> {
    async fn run(mut self, mut events: mpsc::Receiver<Event>, tick_interval: Duration) {
        let mut ticker = time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let done = loop {
            let deferred = tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick();
                    None
                }
                event = events.recv() => match event {
                    Some(Event::Shutdown { done }) => break Some(done),
                    Some(event) => self.handle(event),
                    None => break None,
                },
            };
            if let Err(err) = self.flush() {
                // a node that cannot persist must not keep voting or acking
                error!(node = self.raft.id, %err, "halting node");
                break None;
            }
            if let Some(reply) = deferred {
                reply.send();
            }
        };

        let id = self.raft.id;
        drop(self);
        info!(node = id, "node stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn on_tick(&mut self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.raft.tick(now);
        self.waiters.retain(|_, waiter| !waiter.reply.is_closed());
    }

    fn handle(&mut self, event: Event) -> Option<DeferredReply> {
        match event {
            Event::Submit { command, reply } => {
                let index = match self.raft.propose(command) {
                    Ok(index) => index,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return None;
                    }
                };
                let (tx, applied) = oneshot::channel();
                let waiter = Waiter {
                    term: self.raft.current_term,
                    reply: tx,
                };
                if let Some(stale) = self.waiters.insert(index, waiter) {
                    let _ = stale.reply.send(Err(self.not_leader()));
                }
                let _ = reply.send(Ok(Proposal { index, applied }));
                None
            }
            Event::Get { key, reply } => {
                let _ = reply.send(self.cache.get(&key));
                None
            }
            Event::Keys { reply } => {
                let _ = reply.send(self.cache.keys());
                None
            }
            Event::Stats { reply } => {
                let _ = reply.send(self.cache.stats());
                None
            }
            Event::Status { reply } => {
                let _ = reply.send(self.raft.status());
                None
            }
            Event::RequestVote { request, reply } => {
                let response = self.raft.handle_request_vote(&request);
                Some(DeferredReply::Vote(reply, response))
            }
            Event::AppendEntries { request, reply } => {
                let response = self.raft.handle_append_entries(request);
                Some(DeferredReply::Append(reply, response))
            }
            Event::VoteResult { from, response } => {
                self.raft.handle_vote_response(from, &response);
                None
            }
            Event::AppendResult { from, response } => {
                self.raft.handle_append_entries_response(from, &response);
                None
            }
            // `run` breaks out of the loop on shutdown before dispatching here
            Event::Shutdown { .. } => unreachable!("shutdown is handled by the event loop"),
        }
    }

    /// Persist, then send, then apply.
    fn flush(&mut self) -> Result<(), NodeError> {
        if self.raft.has_ready() {
            let ready = self.raft.take_ready();
            self.storage.persist(&ready)?;
            for outbound in ready.messages {
                self.dispatch(outbound.to, outbound.message);
            }
        }
        self.apply_committed()
    }

    fn dispatch(&self, peer: NodeId, message: RaftMessage) {
        let Some(queue) = self.peers.get(&peer) else {
            warn!(node = self.raft.id, peer, "no worker for peer");
            return;
        };
        match queue.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                // the next heartbeat carries the same information
                debug!(
                    node = self.raft.id,
                    peer,
                    term = message.term(),
                    "peer queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(node = self.raft.id, peer, "peer worker has exited");
            }
        }
    }

    fn apply_committed(&mut self) -> Result<(), NodeError> {
        for entry in self.raft.get_entries_to_apply() {
            self.cache.apply(&entry)?;
            if let Some(waiter) = self.waiters.remove(&entry.index) {
                let result = if waiter.term == entry.term {
                    Ok(entry.index)
                } else {
                    // another leader's entry took the slot
                    Err(self.not_leader())
                };
                let _ = waiter.reply.send(result);
            }
        }
        Ok(())
    }

    fn not_leader(&self) -> NodeError {
        RaftError::NotLeader {
            node_id: self.raft.id,
            leader_hint: self.raft.leader_id,
        }
        .into()
    }
}

/// Delivers one peer's messages in order and feeds the answers back to the
/// event loop. A slow peer only ever backs up its own queue.
async fn peer_worker<T: RaftTransport>(
    peer: NodeId,
    transport: Arc<T>,
    mut queue: mpsc::Receiver<RaftMessage>,
    events: mpsc::Sender<Event>,
    rpc_timeout: Duration,
) {
    while let Some(message) = queue.recv().await {
        let event = match message {
            RaftMessage::RequestVote(request) => {
                match time::timeout(rpc_timeout, transport.request_vote(peer, request)).await {
                    Ok(Ok(response)) => Some(Event::VoteResult { from: peer, response }),
                    Ok(Err(err)) => {
                        debug!(peer, %err, "request_vote failed");
                        None
                    }
                    Err(_) => {
                        debug!(peer, "request_vote timed out");
                        None
                    }
                }
            }
            RaftMessage::AppendEntries(request) => {
                let heartbeat = request.is_heartbeat();
                match time::timeout(rpc_timeout, transport.append_entries(peer, request)).await {
                    Ok(Ok(response)) => Some(Event::AppendResult { from: peer, response }),
                    Ok(Err(err)) => {
                        debug!(peer, heartbeat, %err, "append_entries failed");
                        None
                    }
                    Err(_) => {
                        debug!(peer, heartbeat, "append_entries timed out");
                        None
                    }
                }
            }
        };
        if let Some(event) = event {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }
}
