//! # http transport
//!
//! why: the HTTP/JSON peer protocol between nodes in separate processes
//! relations: HttpTransport implements RaftTransport; raft_router serves a NodeHandle
//! what: reqwest client posting to /raft/*, axum routes, NodeError to http response mapping

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kvraft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RaftStatus, RequestVoteRequest,
    RequestVoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::RaftTransport;
use crate::error::{NodeError, TransportError};
use crate::runtime::NodeHandle;

pub const REQUEST_VOTE_PATH: &str = "/raft/request_vote";
pub const APPEND_ENTRIES_PATH: &str = "/raft/append_entries";
pub const STATUS_PATH: &str = "/raft/status";

/// Sends RPCs as JSON POSTs to each peer's base url, e.g. `http://10.0.0.2:7001`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    peers: HashMap<NodeId, String>,
}

impl HttpTransport {
    pub fn new(peers: HashMap<NodeId, String>, rpc_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(rpc_timeout).build()?;
        let peers = peers
            .into_iter()
            .map(|(id, url)| (id, url.trim_end_matches('/').to_string()))
            .collect();
        Ok(Self { client, peers })
    }

    async fn call<Req, Resp>(&self, target: NodeId, path: &str, body: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let base = self
            .peers
            .get(&target)
            .ok_or(TransportError::UnknownPeer(target))?;
        let response = self
            .client
            .post(format!("{base}{path}"))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let reason = response.text().await.unwrap_or_default();
            debug!(peer = target, %status, "peer rejected rpc");
            return Err(TransportError::Remote {
                peer: target,
                reason: format!("{status}: {reason}"),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.call(target, REQUEST_VOTE_PATH, &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.call(target, APPEND_ENTRIES_PATH, &request).await
    }
}

/// Routes a node serves to its peers.
pub fn raft_router(handle: NodeHandle) -> Router {
    Router::new()
        .route(REQUEST_VOTE_PATH, post(request_vote))
        .route(APPEND_ENTRIES_PATH, post(append_entries))
        .route(STATUS_PATH, get(status))
        .with_state(handle)
}

async fn request_vote(
    State(handle): State<NodeHandle>,
    Json(request): Json<RequestVoteRequest>,
) -> Result<Json<RequestVoteResponse>, NodeError> {
    Ok(Json(handle.request_vote(request).await?))
}

async fn append_entries(
    State(handle): State<NodeHandle>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, NodeError> {
    Ok(Json(handle.append_entries(request).await?))
}

async fn status(State(handle): State<NodeHandle>) -> Result<Json<RaftStatus>, NodeError> {
    Ok(Json(handle.status().await?))
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = match &self {
            NodeError::Stopped(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
