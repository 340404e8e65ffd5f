//! Testing utilities for unit and integration tests
//!
//! `mem_parts` assembles a node on in-memory stores (only the meta files
//! touch disk); `TestCluster` wires several such nodes together over the
//! in-memory transport.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::core::users::UserManager;
use crate::core::{Node, NodeConfig, NodeParts};
use crate::rpc::inmemory::{serve_node, wire_cluster};
use crate::rpc::types::NodeStatus;
use crate::storage::{Binlog, DataStore, MemStore, Meta, OrderedStore};

/// Node collaborators backed by in-memory stores; `meta_dir` must outlive
/// the node.
pub fn mem_parts(meta_dir: &Path) -> NodeParts {
    let meta = Meta::open(meta_dir).expect("failed to open meta dir");
    let binlog = Binlog::open(Box::new(MemStore::new())).expect("failed to open binlog");
    let data_store = DataStore::open(Arc::new(|_name: &str| {
        Ok(Arc::new(MemStore::new()) as Arc<dyn OrderedStore>)
    }))
    .expect("failed to open data store");
    let users =
        UserManager::open(Arc::new(MemStore::new()), None).expect("failed to open user table");
    NodeParts {
        meta,
        binlog,
        data_store,
        users,
    }
}

/// An in-process cluster of nodes joined by the in-memory transport.
pub struct TestCluster {
    pub endpoints: Vec<String>,
    pub nodes: Vec<Arc<Node>>,
    dispatchers: Vec<Option<JoinHandle<()>>>,
    kill_switches: Vec<Arc<AtomicBool>>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Spin up `size` nodes sharing one wire.
    pub async fn start(size: usize, config: NodeConfig) -> TestCluster {
        let endpoints: Vec<String> = (0..size)
            .map(|index| format!("127.0.0.1:{}", 7700 + index))
            .collect();
        let (mut transports, mut receivers) = wire_cluster(&endpoints);
        let mut nodes = Vec::with_capacity(size);
        let mut dispatchers = Vec::with_capacity(size);
        let mut kill_switches = Vec::with_capacity(size);
        let mut dirs = Vec::with_capacity(size);
        for endpoint in &endpoints {
            let dir = TempDir::new().expect("failed to create meta dir");
            let transport = transports.remove(endpoint).expect("transport wired");
            kill_switches.push(transport.kill_switch());
            let node = Node::start(
                config.clone(),
                endpoint.clone(),
                endpoints.clone(),
                mem_parts(dir.path()),
                Arc::new(transport),
            )
            .expect("failed to start node");
            dispatchers.push(Some(serve_node(
                node.clone(),
                receivers.remove(endpoint).expect("receiver wired"),
            )));
            nodes.push(node);
            dirs.push(dir);
        }
        TestCluster {
            endpoints,
            nodes,
            dispatchers,
            kill_switches,
            _dirs: dirs,
        }
    }

    /// Wait until some node reports itself leader; returns its index.
    pub async fn wait_for_leader(&self, limit: Duration) -> Option<usize> {
        let deadline = Instant::now() + limit;
        loop {
            for (index, node) in self.nodes.iter().enumerate() {
                if node.show_status().await.status == NodeStatus::Leader {
                    return Some(index);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until a node other than `not` reports itself leader.
    pub async fn wait_for_other_leader(&self, not: usize, limit: Duration) -> Option<usize> {
        let deadline = Instant::now() + limit;
        loop {
            for (index, node) in self.nodes.iter().enumerate() {
                if index != not && node.show_status().await.status == NodeStatus::Leader {
                    return Some(index);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    /// Cut a node off in both directions.
    pub fn partition(&mut self, index: usize) {
        self.kill_switches[index].store(true, Ordering::Relaxed);
        if let Some(dispatcher) = self.dispatchers[index].take() {
            dispatcher.abort();
        }
    }

    /// Cut only a node's outbound traffic; peers can still reach it.
    pub fn mute(&self, index: usize) {
        self.kill_switches[index].store(true, Ordering::Relaxed);
    }

    /// Restore outbound traffic for a muted node.
    pub fn unmute(&self, index: usize) {
        self.kill_switches[index].store(false, Ordering::Relaxed);
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
