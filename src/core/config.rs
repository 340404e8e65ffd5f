//! Node configuration parameters

use std::time::Duration;

/// Filesystem-safe directory name for a member endpoint
/// (`host:port` with `:` replaced by `_`).
pub fn node_dir_name(endpoint: &str) -> String {
    endpoint.replace(':', "_")
}

/// Timing, batching and admission tunables for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Minimum election timeout (default: 1 s)
    pub elect_timeout_min: Duration,
    /// Maximum election timeout (default: 2 s)
    pub elect_timeout_max: Duration,
    /// Leader heartbeat broadcast period (default: 50 ms)
    pub heartbeat_interval: Duration,
    /// A session with no KeepAlive for longer than this is expired
    /// (default: 6 s)
    pub session_expire_timeout: Duration,
    /// Session reaper period (default: 2 s)
    pub session_check_interval: Duration,
    /// Max entries per replication batch (default: 500)
    pub log_rep_batch_max: usize,
    /// Back-off after a failed or busy replication round (default: 500 ms)
    pub replication_retry_timespan: Duration,
    /// Replication RPC deadline (default: 60 s)
    pub replication_rpc_timeout: Duration,
    /// Hard upper bound on cluster membership (default: 10)
    pub max_cluster_size: usize,
    /// Max in-flight client writes awaiting apply (default: 10 000)
    pub max_write_pending: usize,
    /// Follower backpressure threshold: max gap between commit index and
    /// last applied before replying busy (default: 10 000)
    pub max_commit_pending: i64,
    /// Log GC coordination period (default: 60 s)
    pub gc_interval: Duration,
    /// Deadline for GC status polls and clean requests (default: 2 s)
    pub gc_rpc_timeout: Duration,
    /// Delay before retrying a parent-key watch trigger that found no
    /// watcher (default: 2 s)
    pub watch_retry_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            elect_timeout_min: Duration::from_millis(1000),
            elect_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(50),
            session_expire_timeout: Duration::from_secs(6),
            session_check_interval: Duration::from_secs(2),
            log_rep_batch_max: 500,
            replication_retry_timespan: Duration::from_millis(500),
            replication_rpc_timeout: Duration::from_secs(60),
            max_cluster_size: 10,
            max_write_pending: 10_000,
            max_commit_pending: 10_000,
            gc_interval: Duration::from_secs(60),
            gc_rpc_timeout: Duration::from_secs(2),
            watch_retry_delay: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.elect_timeout_min = min;
        self.elect_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_session_expire_timeout(mut self, timeout: Duration) -> Self {
        self.session_expire_timeout = timeout;
        self
    }

    pub fn with_session_check_interval(mut self, interval: Duration) -> Self {
        self.session_check_interval = interval;
        self
    }

    pub fn with_log_rep_batch_max(mut self, max: usize) -> Self {
        self.log_rep_batch_max = max;
        self
    }

    pub fn with_max_cluster_size(mut self, max: usize) -> Self {
        self.max_cluster_size = max;
        self
    }

    pub fn with_replication_retry_timespan(mut self, span: Duration) -> Self {
        self.replication_retry_timespan = span;
        self
    }

    pub fn with_max_write_pending(mut self, max: usize) -> Self {
        self.max_write_pending = max;
        self
    }

    pub fn with_max_commit_pending(mut self, max: i64) -> Self {
        self.max_commit_pending = max;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// A uniformly random timeout in `[elect_timeout_min, elect_timeout_max)`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.elect_timeout_min.as_millis() as u64;
        let max_ms = self.elect_timeout_max.as_millis() as u64;
        if max_ms <= min_ms {
            return self.elect_timeout_min;
        }
        let timeout_ms = rand::rng().random_range(min_ms..max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_timeout_in_range() {
        let config = NodeConfig::default()
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(500));
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(300));
            assert!(t < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_degenerate_range() {
        let config = NodeConfig::default()
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(300));
        assert_eq!(config.random_election_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_node_dir_name() {
        assert_eq!(node_dir_name("10.0.0.1:8868"), "10.0.0.1_8868");
        assert_eq!(node_dir_name("localhost:9000"), "localhost_9000");
    }
}
