//! HTTP cluster integration tests
//!
//! Spin up a real 3-node cluster over HTTP/TCP and exercise the client
//! surface through the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use lockstep::core::{Node, NodeConfig};
use lockstep::rpc::http::{router, HttpTransport};
use lockstep::rpc::types::{GetResponse, NodeStatus, PutResponse, ShowStatusResponse};
use lockstep::testing::mem_parts;

struct HttpCluster {
    addrs: Vec<SocketAddr>,
    nodes: Vec<Arc<Node>>,
    _dirs: Vec<TempDir>,
}

async fn start_http_cluster(size: usize) -> HttpCluster {
    // bind first so the endpoints are known before the nodes start; the
    // listening endpoint doubles as the node id
    let mut listeners = Vec::with_capacity(size);
    let mut addrs = Vec::with_capacity(size);
    for _ in 0..size {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        listeners.push(listener);
    }
    let members: Vec<String> = addrs.iter().map(|addr| addr.to_string()).collect();
    let config = NodeConfig::default()
        .with_election_timeout(Duration::from_millis(300), Duration::from_millis(500));

    let mut nodes = Vec::with_capacity(size);
    let mut dirs = Vec::with_capacity(size);
    for (index, listener) in listeners.into_iter().enumerate() {
        let dir = TempDir::new().unwrap();
        let node = Node::start(
            config.clone(),
            members[index].clone(),
            members.clone(),
            mem_parts(dir.path()),
            Arc::new(HttpTransport::new()),
        )
        .unwrap();
        let service = router(node.clone());
        tokio::spawn(async move {
            axum::serve(listener, service).await.unwrap();
        });
        nodes.push(node);
        dirs.push(dir);
    }
    HttpCluster {
        addrs,
        nodes,
        _dirs: dirs,
    }
}

async fn show_status(
    client: &reqwest::Client,
    addr: &SocketAddr,
) -> Result<ShowStatusResponse, reqwest::Error> {
    client
        .post(format!("http://{addr}/rpc/show_status"))
        .json(&serde_json::json!(null))
        .send()
        .await?
        .json()
        .await
}

async fn wait_for_leader(client: &reqwest::Client, addrs: &[SocketAddr]) -> Option<SocketAddr> {
    for _ in 0..200 {
        for addr in addrs {
            if let Ok(status) = show_status(client, addr).await {
                if status.status == NodeStatus::Leader {
                    return Some(*addr);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}

#[tokio::test]
async fn test_http_cluster_elects_leader() {
    let cluster = start_http_cluster(3).await;
    let client = reqwest::Client::new();

    let leader = wait_for_leader(&client, &cluster.addrs).await;
    assert!(leader.is_some(), "cluster should elect a leader over http");

    for node in &cluster.nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_http_put_then_get() {
    let cluster = start_http_cluster(3).await;
    let client = reqwest::Client::new();
    let leader = wait_for_leader(&client, &cluster.addrs)
        .await
        .expect("leader");

    // retry past safe mode
    let mut stored = false;
    for _ in 0..100 {
        let response: PutResponse = client
            .post(format!("http://{leader}/api/put"))
            .json(&serde_json::json!({"key": "x", "value": "42", "uuid": ""}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if response.success {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stored);

    let mut read = None;
    for _ in 0..100 {
        let response: GetResponse = client
            .post(format!("http://{leader}/api/get"))
            .json(&serde_json::json!({"key": "x", "uuid": ""}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if response.success {
            read = Some(response);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let read = read.expect("get should succeed once safe mode clears");
    assert!(read.hit);
    assert_eq!(read.value, "42");

    for node in &cluster.nodes {
        node.shutdown().await;
    }
}
