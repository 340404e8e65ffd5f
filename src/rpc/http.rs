//! HTTP/JSON service implementation
//!
//! Uses axum for the server and reqwest for the client. Every wire method
//! is one POST route; watch requests are held open until the watch fires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::node::Node;
use super::traits::{RpcError, RpcResult, Transport};
use super::types::*;

/// Default round-trip bound for calls without an explicit deadline
/// (vote, keep-alive fan-out).
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client side of the [`Transport`] trait.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .build()
            .expect("failed to build http client");
        HttpTransport { client }
    }

    async fn call<Req, Resp>(
        &self,
        target: &str,
        path: &str,
        request: &Req,
        deadline: Option<Duration>,
    ) -> RpcResult<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("http://{target}{path}");
        let mut builder = self.client.post(&url).json(request);
        if let Some(deadline) = deadline {
            builder = builder.timeout(deadline);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::ConnectionFailed
            }
        })?;
        response
            .json::<Resp>()
            .await
            .map_err(|_| RpcError::ConnectionFailed)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
        deadline: Duration,
    ) -> RpcResult<AppendEntriesResponse> {
        self.call(target, "/rpc/append_entries", &request, Some(deadline))
            .await
    }

    async fn vote(&self, target: &str, request: VoteRequest) -> RpcResult<VoteResponse> {
        self.call(target, "/rpc/vote", &request, None).await
    }

    async fn keep_alive(
        &self,
        target: &str,
        request: KeepAliveRequest,
    ) -> RpcResult<KeepAliveResponse> {
        self.call(target, "/api/keep_alive", &request, None).await
    }

    async fn show_status(
        &self,
        target: &str,
        deadline: Duration,
    ) -> RpcResult<ShowStatusResponse> {
        self.call(target, "/rpc/show_status", &(), Some(deadline))
            .await
    }

    async fn clean_binlog(
        &self,
        target: &str,
        request: CleanBinlogRequest,
        deadline: Duration,
    ) -> RpcResult<CleanBinlogResponse> {
        self.call(target, "/rpc/clean_binlog", &request, Some(deadline))
            .await
    }
}

/// Build the service router for one node: replication RPCs under `/rpc`,
/// the client surface under `/api`.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/rpc/append_entries", post(append_entries))
        .route("/rpc/vote", post(vote))
        .route("/rpc/show_status", post(show_status))
        .route("/rpc/clean_binlog", post(clean_binlog))
        .route("/api/put", post(put))
        .route("/api/get", post(get))
        .route("/api/delete", post(delete))
        .route("/api/scan", post(scan))
        .route("/api/lock", post(lock))
        .route("/api/unlock", post(unlock))
        .route("/api/watch", post(watch))
        .route("/api/keep_alive", post(keep_alive))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/register", post(register))
        .route("/api/rpc_stat", post(rpc_stat))
        .with_state(node)
}

async fn append_entries(
    State(node): State<Arc<Node>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(node.append_entries(request).await)
}

async fn vote(
    State(node): State<Arc<Node>>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(node.vote(request).await)
}

async fn show_status(State(node): State<Arc<Node>>) -> Json<ShowStatusResponse> {
    Json(node.show_status().await)
}

async fn clean_binlog(
    State(node): State<Arc<Node>>,
    Json(request): Json<CleanBinlogRequest>,
) -> Json<CleanBinlogResponse> {
    Json(node.clean_binlog(request).await)
}

async fn put(State(node): State<Arc<Node>>, Json(request): Json<PutRequest>) -> Json<PutResponse> {
    Json(node.put(request).await)
}

async fn get(State(node): State<Arc<Node>>, Json(request): Json<GetRequest>) -> Json<GetResponse> {
    Json(node.get(request).await)
}

async fn delete(
    State(node): State<Arc<Node>>,
    Json(request): Json<DelRequest>,
) -> Json<DelResponse> {
    Json(node.delete(request).await)
}

async fn scan(
    State(node): State<Arc<Node>>,
    Json(request): Json<ScanRequest>,
) -> Json<ScanResponse> {
    Json(node.scan(request).await)
}

async fn lock(
    State(node): State<Arc<Node>>,
    Json(request): Json<LockRequest>,
) -> Json<LockResponse> {
    Json(node.lock(request).await)
}

async fn unlock(
    State(node): State<Arc<Node>>,
    Json(request): Json<UnlockRequest>,
) -> Json<UnlockResponse> {
    Json(node.unlock(request).await)
}

async fn watch(
    State(node): State<Arc<Node>>,
    Json(request): Json<WatchRequest>,
) -> Json<WatchResponse> {
    Json(node.watch(request).await)
}

async fn keep_alive(
    State(node): State<Arc<Node>>,
    Json(request): Json<KeepAliveRequest>,
) -> Json<KeepAliveResponse> {
    Json(node.keep_alive(request).await)
}

async fn login(
    State(node): State<Arc<Node>>,
    Json(request): Json<LoginRequest>,
) -> Json<LoginResponse> {
    Json(node.login(request).await)
}

async fn logout(
    State(node): State<Arc<Node>>,
    Json(request): Json<LogoutRequest>,
) -> Json<LogoutResponse> {
    Json(node.logout(request).await)
}

async fn register(
    State(node): State<Arc<Node>>,
    Json(request): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    Json(node.register(request).await)
}

async fn rpc_stat(
    State(node): State<Arc<Node>>,
    Json(request): Json<RpcStatRequest>,
) -> Json<RpcStatResponse> {
    Json(node.rpc_stat(request).await)
}
