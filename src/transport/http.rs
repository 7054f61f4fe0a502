//! HTTP transport implementation for RPC between nodes
//!
//! Uses axum for the server and reqwest for the client. Every RPC is a JSON
//! `POST /raft/<name>`; `GET /raft/status` reports the node's status.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::dispatcher::RpcSender;
use crate::core::error::RaftError;
use crate::core::log::NodeId;
use crate::core::raft_core::NodeStatus;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{Transport, TransportError};

/// HTTP transport for outbound RPCs
pub struct HttpTransport {
    peers: HashMap<NodeId, SocketAddr>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(peers: HashMap<NodeId, SocketAddr>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport { peers, client })
    }

    async fn post<A, R>(&self, target: NodeId, rpc: &str, args: &A) -> Result<R, TransportError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound(target))?;
        let url = format!("http://{}/raft/{}", addr, rpc);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| classify(target, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Remote {
                node: target,
                message: format!("{}: {}", status, message),
            });
        }

        response.json::<R>().await.map_err(|e| classify(target, e))
    }
}

fn classify(target: NodeId, error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(target)
    } else {
        TransportError::ConnectionFailed(target)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post(target, "request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post(target, "append_entries", &args).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.post(target, "install_snapshot", &args).await
    }
}

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct HttpState {
    rpc: RpcSender,
    status: watch::Receiver<NodeStatus>,
}

type RpcResponse<T> = Result<Json<T>, (StatusCode, String)>;

/// Create an axum router that feeds inbound RPCs into a node
pub fn create_router(rpc: RpcSender, status: watch::Receiver<NodeStatus>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/raft/status", get(handle_status))
        .with_state(HttpState { rpc, status })
}

fn to_response<T>(result: Result<T, RaftError>) -> RpcResponse<T> {
    match result {
        Ok(value) => Ok(Json(value)),
        Err(RaftError::NodeStopped) => Err((StatusCode::SERVICE_UNAVAILABLE, RaftError::NodeStopped.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn handle_request_vote(
    State(state): State<HttpState>,
    Json(args): Json<RequestVoteArgs>,
) -> RpcResponse<RequestVoteResult> {
    to_response(state.rpc.request_vote(args).await)
}

async fn handle_append_entries(
    State(state): State<HttpState>,
    Json(args): Json<AppendEntriesArgs>,
) -> RpcResponse<AppendEntriesResult> {
    to_response(state.rpc.append_entries(args).await)
}

async fn handle_install_snapshot(
    State(state): State<HttpState>,
    Json(args): Json<InstallSnapshotArgs>,
) -> RpcResponse<InstallSnapshotResult> {
    to_response(state.rpc.install_snapshot(args).await)
}

async fn handle_status(State(state): State<HttpState>) -> Json<NodeStatus> {
    Json(state.status.borrow().clone())
}
