//! In-memory transport for testing
//!
//! Channel-based request/response plumbing between nodes in one process.
//! Each node gets a dispatcher that serves incoming requests against its
//! `Node`; dropping the dispatcher simulates a partition (sends fail).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::node::Node;
use super::traits::{RpcError, RpcResult, Transport};
use super::types::*;

/// Requests that can be delivered to a node
pub enum PeerRequest {
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    KeepAlive {
        request: KeepAliveRequest,
        reply: oneshot::Sender<KeepAliveResponse>,
    },
    ShowStatus {
        reply: oneshot::Sender<ShowStatusResponse>,
    },
    CleanBinlog {
        request: CleanBinlogRequest,
        reply: oneshot::Sender<CleanBinlogResponse>,
    },
}

/// Channel transport with senders to every cluster member.
pub struct InMemoryTransport {
    senders: HashMap<String, mpsc::Sender<PeerRequest>>,
    /// When raised, every outbound call fails; paired with dropping the
    /// dispatcher this models a full partition.
    down: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn new(senders: HashMap<String, mpsc::Sender<PeerRequest>>) -> Self {
        InMemoryTransport {
            senders,
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that cuts this transport's outbound traffic when set.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        self.down.clone()
    }

    async fn deliver<T>(
        &self,
        target: &str,
        deadline: Duration,
        make: impl FnOnce(oneshot::Sender<T>) -> PeerRequest,
    ) -> RpcResult<T> {
        if self.down.load(Ordering::Relaxed) {
            return Err(RpcError::ConnectionFailed);
        }
        let sender = self
            .senders
            .get(target)
            .ok_or_else(|| RpcError::NodeNotFound(target.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make(reply_tx))
            .await
            .map_err(|_| RpcError::ConnectionFailed)?;
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcError::ConnectionFailed),
            Err(_) => Err(RpcError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn append_entries(
        &self,
        target: &str,
        request: AppendEntriesRequest,
        deadline: Duration,
    ) -> RpcResult<AppendEntriesResponse> {
        self.deliver(target, deadline, |reply| PeerRequest::AppendEntries {
            request,
            reply,
        })
        .await
    }

    async fn vote(&self, target: &str, request: VoteRequest) -> RpcResult<VoteResponse> {
        self.deliver(target, Duration::from_secs(10), |reply| PeerRequest::Vote {
            request,
            reply,
        })
        .await
    }

    async fn keep_alive(
        &self,
        target: &str,
        request: KeepAliveRequest,
    ) -> RpcResult<KeepAliveResponse> {
        self.deliver(target, Duration::from_secs(10), |reply| {
            PeerRequest::KeepAlive { request, reply }
        })
        .await
    }

    async fn show_status(
        &self,
        target: &str,
        deadline: Duration,
    ) -> RpcResult<ShowStatusResponse> {
        self.deliver(target, deadline, |reply| PeerRequest::ShowStatus { reply })
            .await
    }

    async fn clean_binlog(
        &self,
        target: &str,
        request: CleanBinlogRequest,
        deadline: Duration,
    ) -> RpcResult<CleanBinlogResponse> {
        self.deliver(target, deadline, |reply| PeerRequest::CleanBinlog {
            request,
            reply,
        })
        .await
    }
}

/// Build one transport per endpoint plus the matching request receivers.
pub fn wire_cluster(
    endpoints: &[String],
) -> (
    HashMap<String, InMemoryTransport>,
    HashMap<String, mpsc::Receiver<PeerRequest>>,
) {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for endpoint in endpoints {
        let (tx, rx) = mpsc::channel(64);
        senders.insert(endpoint.clone(), tx);
        receivers.insert(endpoint.clone(), rx);
    }
    let transports = endpoints
        .iter()
        .map(|endpoint| (endpoint.clone(), InMemoryTransport::new(senders.clone())))
        .collect();
    (transports, receivers)
}

/// Serve a node's incoming requests. Each request runs in its own task so
/// a slow handler cannot block the queue. Abort the handle (or drop it via
/// `Node::shutdown`) to partition the node.
pub fn serve_node(node: Arc<Node>, mut receiver: mpsc::Receiver<PeerRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = receiver.recv().await {
            let node = node.clone();
            tokio::spawn(async move {
                match request {
                    PeerRequest::AppendEntries { request, reply } => {
                        let _ = reply.send(node.append_entries(request).await);
                    }
                    PeerRequest::Vote { request, reply } => {
                        let _ = reply.send(node.vote(request).await);
                    }
                    PeerRequest::KeepAlive { request, reply } => {
                        let _ = reply.send(node.keep_alive(request).await);
                    }
                    PeerRequest::ShowStatus { reply } => {
                        let _ = reply.send(node.show_status().await);
                    }
                    PeerRequest::CleanBinlog { request, reply } => {
                        let _ = reply.send(node.clean_binlog(request).await);
                    }
                }
            });
        }
    })
}
