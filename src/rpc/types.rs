//! Wire types for the node service
//!
//! Every request carries an optional `uuid` (login token). Responses carry
//! `success` or `status`, plus `leader_id` (non-empty when a follower is
//! redirecting the client) and `uuid_expired` when the token is unknown.

use serde::{Deserialize, Serialize};

use crate::storage::LogEntry;

/// Response-level status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    UnknownUser,
    Error,
    BadSlot,
    UuidExpired,
    Busy,
    NotLeader,
}

/// Replication role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Follower => write!(f, "follower"),
            NodeStatus::Candidate => write!(f, "candidate"),
            NodeStatus::Leader => write!(f, "leader"),
        }
    }
}

// === Replication RPCs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: i64,
    pub leader_id: String,
    /// Index preceding `entries`; `-1` when replicating from the start.
    /// Unused (left at `-1`) in pure heartbeats.
    pub prev_log_index: i64,
    pub prev_log_term: i64,
    pub leader_commit_index: i64,
    /// Empty for heartbeats.
    pub entries: Vec<LogEntry>,
}

impl AppendEntriesRequest {
    /// A heartbeat from `leader_id` at `term`.
    pub fn heartbeat(term: i64, leader_id: String, leader_commit_index: i64) -> Self {
        AppendEntriesRequest {
            term,
            leader_id,
            prev_log_index: -1,
            prev_log_term: -1,
            leader_commit_index,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub current_term: i64,
    pub success: bool,
    /// Receiver's log length, used by the leader to rewind `next_index`.
    pub log_length: i64,
    /// Receiver is applying too far behind its commit index; back off.
    pub is_busy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: i64,
    pub candidate_id: String,
    pub last_log_index: i64,
    pub last_log_term: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: i64,
    pub vote_granted: bool,
}

// === Client RPCs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub success: bool,
    pub hit: bool,
    pub value: String,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelRequest {
    pub key: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelResponse {
    pub success: bool,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub start_key: String,
    /// Exclusive upper bound; empty means unbounded.
    pub end_key: String,
    pub size_limit: usize,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub success: bool,
    pub leader_id: String,
    pub items: Vec<ScanItem>,
    pub has_more: bool,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub key: String,
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub success: bool,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub key: String,
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockResponse {
    pub success: bool,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRequest {
    pub key: String,
    pub session_id: String,
    /// Value the client last saw; a difference fires the watch immediately.
    pub old_value: String,
    pub key_exist: bool,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchResponse {
    /// The key the watch was registered on.
    pub watch_key: String,
    /// The key that actually changed (a child, for parent watches).
    pub key: String,
    pub value: String,
    pub deleted: bool,
    pub canceled: bool,
    pub success: bool,
    pub leader_id: String,
    #[serde(default)]
    pub uuid_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: String,
    #[serde(default)]
    pub uuid: String,
    /// Keys this session believes it holds locks on; replaces the
    /// server-side set.
    #[serde(default)]
    pub locks: Vec<String>,
    #[serde(default)]
    pub forward_from_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub success: bool,
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: Status,
    pub uuid: String,
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub status: Status,
    pub leader_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub passwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    pub leader_id: String,
}

// === Admin RPCs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowStatusResponse {
    pub status: NodeStatus,
    pub term: i64,
    pub last_log_index: i64,
    pub last_log_term: i64,
    pub commit_index: i64,
    pub last_applied: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBinlogRequest {
    /// Entries strictly below this index are safe to delete.
    pub end_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBinlogResponse {
    pub success: bool,
}

/// Operations that carry performance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatOp {
    Put,
    Get,
    Delete,
    Scan,
    KeepAlive,
    Lock,
    Unlock,
    Watch,
}

impl StatOp {
    pub const ALL: [StatOp; 8] = [
        StatOp::Put,
        StatOp::Get,
        StatOp::Delete,
        StatOp::Scan,
        StatOp::KeepAlive,
        StatOp::Lock,
        StatOp::Unlock,
        StatOp::Watch,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatRequest {
    /// Empty means "all operations".
    #[serde(default)]
    pub op: Vec<StatOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfo {
    pub current_stat: i64,
    pub average_stat: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatResponse {
    pub stats: Vec<StatInfo>,
    pub status: NodeStatus,
}
