//! lockstep server binary
//!
//! Runs one cluster member. The listening endpoint doubles as the node id
//! and is taken from `--cluster_members` by `--server_id` (1-based).
//!
//! Example for a 3-node cluster:
//!   lockstep-server --cluster_members=127.0.0.1:8868,127.0.0.1:8869,127.0.0.1:8870 --server_id=1
//!   lockstep-server --cluster_members=127.0.0.1:8868,127.0.0.1:8869,127.0.0.1:8870 --server_id=2
//!   lockstep-server --cluster_members=127.0.0.1:8868,127.0.0.1:8869,127.0.0.1:8870 --server_id=3

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use lockstep::core::{node_dir_name, Node, NodeConfig, NodeParts};
use lockstep::core::users::UserManager;
use lockstep::rpc::http::{router, HttpTransport};
use lockstep::storage::{
    Binlog, DataStore, Meta, OrderedStore, SledStore, StoreResult, StoreTuning,
};

#[derive(Parser, Debug)]
#[command(name = "lockstep-server", version, about = "Replicated coordination service node")]
struct Args {
    /// Cluster membership as host:port,host:port,...
    #[arg(long = "cluster_members", value_delimiter = ',', required = true)]
    cluster_members: Vec<String>,

    /// 1-based index of this node within --cluster_members
    #[arg(long = "server_id")]
    server_id: usize,

    /// Minimum election timeout in milliseconds
    #[arg(long = "elect_timeout_min", default_value_t = 1000)]
    elect_timeout_min: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long = "elect_timeout_max", default_value_t = 2000)]
    elect_timeout_max: u64,

    /// Session expiry in milliseconds
    #[arg(long = "session_expire_timeout", default_value_t = 6000)]
    session_expire_timeout: u64,

    /// Maximum entries per replication batch
    #[arg(long = "log_rep_batch_max", default_value_t = 500)]
    log_rep_batch_max: usize,

    /// Back-off after a failed replication round, in milliseconds
    #[arg(long = "replication_retry_timespan", default_value_t = 500)]
    replication_retry_timespan: u64,

    /// Hard upper bound on cluster size
    #[arg(long = "max_cluster_size", default_value_t = 10)]
    max_cluster_size: usize,

    /// Maximum in-flight client writes
    #[arg(long = "max_write_pending", default_value_t = 10000)]
    max_write_pending: usize,

    /// Follower busy threshold (commit index ahead of applied index)
    #[arg(long = "max_commit_pending", default_value_t = 10000)]
    max_commit_pending: i64,

    /// Binlog GC coordination interval in seconds
    #[arg(long = "ins_gc_interval", default_value_t = 60)]
    ins_gc_interval: u64,

    /// Directory for meta files and application data
    #[arg(long = "ins_data_dir", default_value = "./data")]
    ins_data_dir: PathBuf,

    /// Directory for the replicated log
    #[arg(long = "ins_binlog_dir", default_value = "./binlog")]
    ins_binlog_dir: PathBuf,

    /// Compress the binlog backend
    #[arg(long = "ins_binlog_compress", default_value_t = false)]
    ins_binlog_compress: bool,

    /// Binlog block size in KiB (accepted for compatibility; the backend
    /// has no block knob)
    #[arg(long = "ins_binlog_block_size", default_value_t = 4)]
    ins_binlog_block_size: usize,

    /// Binlog write buffer in MiB
    #[arg(long = "ins_binlog_write_buffer_size", default_value_t = 4)]
    ins_binlog_write_buffer_size: usize,
}

impl Args {
    fn node_config(&self) -> NodeConfig {
        NodeConfig::default()
            .with_election_timeout(
                Duration::from_millis(self.elect_timeout_min),
                Duration::from_millis(self.elect_timeout_max),
            )
            .with_session_expire_timeout(Duration::from_millis(self.session_expire_timeout))
            .with_log_rep_batch_max(self.log_rep_batch_max)
            .with_max_cluster_size(self.max_cluster_size)
            .with_replication_retry_timespan(Duration::from_millis(self.replication_retry_timespan))
            .with_max_write_pending(self.max_write_pending)
            .with_max_commit_pending(self.max_commit_pending)
            .with_gc_interval(Duration::from_secs(self.ins_gc_interval))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.server_id == 0 || args.server_id > args.cluster_members.len() {
        return Err(format!(
            "--server_id {} is out of range for {} members",
            args.server_id,
            args.cluster_members.len()
        )
        .into());
    }
    let self_id = args.cluster_members[args.server_id - 1].clone();
    let sub_dir = node_dir_name(&self_id);

    let meta_dir = args.ins_data_dir.join(&sub_dir);
    let meta = Meta::open(&meta_dir)?;
    let root = meta.read_root_credential()?;

    let binlog_tuning = StoreTuning {
        compress: args.ins_binlog_compress,
        block_size: args.ins_binlog_block_size << 10,
        write_buffer_size: args.ins_binlog_write_buffer_size << 20,
    };
    info!(
        dir = %args.ins_binlog_dir.join(&sub_dir).display(),
        compress = binlog_tuning.compress,
        block_size = binlog_tuning.block_size,
        write_buffer_size = binlog_tuning.write_buffer_size,
        "opening binlog"
    );
    let binlog_store = SledStore::open(
        args.ins_binlog_dir.join(&sub_dir).join("#binlog"),
        binlog_tuning,
    )?;
    let binlog = Binlog::open(Box::new(binlog_store))?;

    let store_dir = meta_dir.join("store");
    let opener_dir = store_dir.clone();
    let data_store = DataStore::open(Arc::new(move |name: &str| -> StoreResult<Arc<dyn OrderedStore>> {
        let db_name = format!("{name}@db");
        let store = SledStore::open(opener_dir.join(db_name), StoreTuning::default())?;
        Ok(Arc::new(store))
    }))?;

    let user_store = SledStore::open(store_dir.join("#user@db"), StoreTuning::default())?;
    let users = UserManager::open(Arc::new(user_store), root)?;

    let node = Node::start(
        args.node_config(),
        self_id.clone(),
        args.cluster_members.clone(),
        NodeParts {
            meta,
            binlog,
            data_store,
            users,
        },
        Arc::new(HttpTransport::new()),
    )?;

    let listener = tokio::net::TcpListener::bind(&self_id).await?;
    info!(endpoint = %self_id, "node listening");
    axum::serve(listener, router(node.clone()))
        .with_graceful_shutdown(shutdown_signal(node))
        .await?;
    info!("clean shutdown");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, stopping the node first.
async fn shutdown_signal(node: Arc<Node>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    node.shutdown().await;
}
