//! Transport abstraction for peer-to-peer RPC
//!
//! The replication engine only ever needs a request/response round trip
//! with an explicit deadline; fire-and-forget sends are expressed by
//! spawning the call and dropping the result.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    KeepAliveRequest, KeepAliveResponse, ShowStatusResponse, VoteRequest, VoteResponse,
};

/// Errors that can occur during transport operations
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection to peer failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("unknown cluster member {0:?}")]
    NodeNotFound(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Peer-to-peer RPC transport. Targets are cluster member endpoints
/// (`host:port`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Replication and read-quorum heartbeats; `deadline` bounds the round
    /// trip (60 s for replication, shorter for reads).
    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
        deadline: Duration,
    ) -> RpcResult<AppendEntriesResponse>;

    async fn vote(&self, target: &str, request: VoteRequest) -> RpcResult<VoteResponse>;

    /// Leader-to-follower session fan-out.
    async fn keep_alive(
        &self,
        target: &str,
        request: KeepAliveRequest,
    ) -> RpcResult<KeepAliveResponse>;

    /// GC coordinator poll.
    async fn show_status(
        &self,
        target: &str,
        deadline: Duration,
    ) -> RpcResult<ShowStatusResponse>;

    async fn clean_binlog(
        &self,
        target: &str,
        request: CleanBinlogRequest,
        deadline: Duration,
    ) -> RpcResult<CleanBinlogResponse>;
}
