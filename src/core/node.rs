//! Cluster node: replication engine and coupled state machine
//!
//! One `Node` owns the replicated log, the derived application state and
//! the volatile session/watch tables. A single mutex guards the
//! replication state (status, term, progress, pending acks); sessions,
//! session locks and watches each have their own lock. Background workers
//! are tokio tasks woken through `Notify` handles with bounded waits so a
//! shutdown flag poll always makes progress.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::rpc::types::{
    AppendEntriesRequest, AppendEntriesResponse, CleanBinlogRequest, CleanBinlogResponse,
    DelResponse, LockResponse, LoginResponse, LogoutResponse, NodeStatus, PutResponse,
    RegisterResponse, ShowStatusResponse, Status, UnlockResponse, VoteRequest, VoteResponse,
};
use crate::rpc::Transport;
use crate::storage::binlog::{decode_i64, encode_i64};
use crate::storage::data::{parse_value, tag_value, ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX};
use crate::storage::{Binlog, DataStore, LogEntry, LogOp, Meta, StoreError, StoreResult};

use super::config::NodeConfig;
use super::perf::PerfCounter;
use super::session::SessionTable;
use super::users::UserManager;
use super::watch::{bind_key, parent_key, WatchRegistry};

/// Poll bound for condition waits, so shutdown is observed promptly.
const COND_WAIT: Duration = Duration::from_secs(2);

/// Response slot for an in-flight client write, completed by the apply
/// worker once its log index is applied. Dropping the sender (step-down)
/// fails the waiting handler.
pub(crate) enum PendingAck {
    Put(oneshot::Sender<PutResponse>),
    Del(oneshot::Sender<DelResponse>),
    Lock(oneshot::Sender<LockResponse>),
    Unlock(oneshot::Sender<UnlockResponse>),
    Login(oneshot::Sender<LoginResponse>),
    Logout(oneshot::Sender<LogoutResponse>),
    Register(oneshot::Sender<RegisterResponse>),
}

fn complete_ack(ack: PendingAck, log_status: Status, new_uuid: &str) {
    match ack {
        PendingAck::Put(tx) => {
            let _ = tx.send(PutResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        PendingAck::Del(tx) => {
            let _ = tx.send(DelResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        PendingAck::Lock(tx) => {
            let _ = tx.send(LockResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        PendingAck::Unlock(tx) => {
            let _ = tx.send(UnlockResponse {
                success: true,
                leader_id: String::new(),
                uuid_expired: false,
            });
        }
        PendingAck::Login(tx) => {
            let _ = tx.send(LoginResponse {
                status: log_status,
                uuid: new_uuid.to_string(),
                leader_id: String::new(),
            });
        }
        PendingAck::Logout(tx) => {
            let _ = tx.send(LogoutResponse {
                status: log_status,
                leader_id: String::new(),
            });
        }
        PendingAck::Register(tx) => {
            let _ = tx.send(RegisterResponse {
                status: log_status,
                leader_id: String::new(),
            });
        }
    }
}

/// Replication state guarded by the main mutex.
pub(crate) struct NodeState {
    pub(crate) status: NodeStatus,
    pub(crate) current_term: i64,
    /// term -> candidate this node granted its vote to
    pub(crate) voted_for: HashMap<i64, String>,
    /// term -> grants received while campaigning (self included)
    pub(crate) vote_grant: HashMap<i64, usize>,
    pub(crate) current_leader: String,
    /// Heartbeats seen since the last election-timer check.
    pub(crate) heartbeat_count: u64,
    pub(crate) commit_index: i64,
    pub(crate) last_applied: i64,
    pub(crate) next_index: HashMap<String, i64>,
    pub(crate) match_index: HashMap<String, i64>,
    /// Followers with a live replicator task.
    pub(crate) replicating: HashSet<String>,
    pub(crate) pending_acks: HashMap<i64, PendingAck>,
    pub(crate) in_safe_mode: bool,
    /// When the last read quorum was confirmed; fresh confirmations let
    /// reads be answered locally.
    pub(crate) heartbeat_read_at: Option<Instant>,
    pub(crate) last_safe_clean_index: i64,
    pub(crate) meta: Meta,
}

/// Durable collaborators a node is assembled from.
pub struct NodeParts {
    pub meta: Meta,
    pub binlog: Binlog,
    pub data_store: DataStore,
    pub users: UserManager,
}

pub struct Node {
    me: Weak<Node>,
    pub(crate) config: NodeConfig,
    pub(crate) self_id: String,
    pub(crate) members: Vec<String>,
    pub(crate) others: Vec<String>,
    pub(crate) single_node_mode: bool,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) binlog: Binlog,
    pub(crate) data_store: DataStore,
    pub(crate) users: UserManager,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) sessions: parking_lot::Mutex<SessionTable>,
    pub(crate) session_locks: parking_lot::Mutex<HashMap<String, BTreeSet<String>>>,
    pub(crate) watches: parking_lot::Mutex<WatchRegistry>,
    /// Broadcast by any appender; replicators wait on it when caught up.
    pub(crate) replication_notify: Notify,
    /// Signalled when the commit index advances.
    pub(crate) commit_notify: Notify,
    stop: AtomicBool,
    pub(crate) start_time: Instant,
    pub(crate) perf: PerfCounter,
}

impl Node {
    /// Assemble the node and spawn its background workers. Must run inside
    /// a tokio runtime. Panics on a misconfigured membership, fails on
    /// unreadable persistent state.
    pub fn start(
        config: NodeConfig,
        self_id: String,
        members: Vec<String>,
        parts: NodeParts,
        transport: Arc<dyn Transport>,
    ) -> StoreResult<Arc<Node>> {
        assert!(
            members.contains(&self_id),
            "this node ({self_id}) is not in the cluster membership"
        );
        assert!(
            members.len() <= config.max_cluster_size,
            "cluster size {} exceeds the configured maximum {}",
            members.len(),
            config.max_cluster_size
        );
        let others: Vec<String> = members
            .iter()
            .filter(|member| **member != self_id)
            .cloned()
            .collect();
        let single_node_mode = members.len() == 1;
        for member in &members {
            if *member == self_id {
                info!(member = %member, "cluster member [self]");
            } else {
                info!(member = %member, "cluster member");
            }
        }

        let NodeParts {
            meta,
            binlog,
            data_store,
            users,
        } = parts;
        let current_term = meta.read_current_term()?;
        let mut voted_for = HashMap::new();
        if let Some((term, candidate)) = meta.read_vote()? {
            voted_for.insert(term, candidate);
        }
        let last_applied = match data_store.get(ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX)? {
            Some(raw) => decode_i64(&raw)?,
            None => -1,
        };
        info!(current_term, last_applied, "recovered node state");

        let node = Arc::new_cyclic(|me| Node {
            me: me.clone(),
            config,
            self_id,
            members,
            others,
            single_node_mode,
            transport,
            binlog,
            data_store,
            users,
            state: Mutex::new(NodeState {
                status: NodeStatus::Follower,
                current_term,
                voted_for,
                vote_grant: HashMap::new(),
                current_leader: String::new(),
                heartbeat_count: 0,
                commit_index: -1,
                last_applied,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                replicating: HashSet::new(),
                pending_acks: HashMap::new(),
                in_safe_mode: true,
                heartbeat_read_at: None,
                last_safe_clean_index: -1,
                meta,
            }),
            sessions: parking_lot::Mutex::new(SessionTable::new()),
            session_locks: parking_lot::Mutex::new(HashMap::new()),
            watches: parking_lot::Mutex::new(WatchRegistry::new()),
            replication_notify: Notify::new(),
            commit_notify: Notify::new(),
            stop: AtomicBool::new(false),
            start_time: Instant::now(),
            perf: PerfCounter::new(),
        });

        tokio::spawn(node.clone().apply_worker());
        tokio::spawn(node.clone().election_timer());
        tokio::spawn(node.clone().heartbeat_loop());
        tokio::spawn(node.clone().session_reaper());
        tokio::spawn(node.clone().gc_loop());
        tokio::spawn(node.clone().perf_roller());
        if node.single_node_mode {
            tokio::spawn(node.clone().bootstrap_single_node());
        }
        Ok(node)
    }

    pub(crate) fn arc(&self) -> Arc<Node> {
        self.me.upgrade().expect("node is alive while handling requests")
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Cooperative shutdown: raise the flag and wake every worker.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.commit_notify.notify_waiters();
        self.replication_notify.notify_waiters();
        info!("node shutting down");
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    // === Status transitions ===

    /// Adopt a higher term and fall back to follower. Pending client acks
    /// are dropped; their handlers fail with a redirect.
    pub(crate) fn trans_to_follower(&self, state: &mut NodeState, reason: &str, new_term: i64) {
        info!(
            reason,
            old_term = state.current_term,
            new_term,
            "term is outdated, stepping down to follower"
        );
        state.status = NodeStatus::Follower;
        state.current_term = new_term;
        state
            .meta
            .write_current_term(new_term)
            .expect("failed to persist current term");
        state.pending_acks.clear();
    }

    fn trans_to_leader(&self, state: &mut NodeState) {
        state.in_safe_mode = true;
        state.status = NodeStatus::Leader;
        state.current_leader = self.self_id.clone();
        info!(term = state.current_term, "won the election");

        for follower in &self.others {
            if state.replicating.contains(follower) {
                debug!(follower = %follower, "replicator already running");
                continue;
            }
            state.next_index.insert(follower.clone(), self.binlog.length());
            state.match_index.insert(follower.clone(), -1);
            state.replicating.insert(follower.clone());
            tokio::spawn(self.arc().replicate_log(follower.clone()));
        }

        // no-op barrier: committing it proves this term's quorum and lets
        // the leader leave safe mode
        let noop = LogEntry {
            op: LogOp::Nop,
            user: String::new(),
            key: "Ping".to_string(),
            value: String::new(),
            term: state.current_term,
        };
        self.binlog
            .append(&noop)
            .expect("failed to append no-op entry");
        self.replication_notify.notify_waiters();
        if self.single_node_mode {
            self.update_commit_index(state, self.binlog.last_index());
        }
    }

    async fn bootstrap_single_node(self: Arc<Node>) {
        let mut state = self.state.lock().await;
        if state.status == NodeStatus::Leader {
            return;
        }
        state.status = NodeStatus::Leader;
        state.current_leader = self.self_id.clone();
        state.in_safe_mode = false;
        state.commit_index = state.last_applied;
        state.current_term += 1;
        let term = state.current_term;
        state
            .meta
            .write_current_term(term)
            .expect("failed to persist current term");
        info!(term, "single node mode, assuming leadership");
    }

    // === Election ===

    async fn election_timer(self: Arc<Node>) {
        if self.single_node_mode {
            return;
        }
        loop {
            sleep(self.config.random_election_timeout()).await;
            if self.stopped() {
                return;
            }
            self.try_to_be_leader().await;
        }
    }

    async fn try_to_be_leader(&self) {
        let mut state = self.state.lock().await;
        if state.status == NodeStatus::Leader {
            return;
        }
        if state.status == NodeStatus::Follower && state.heartbeat_count > 0 {
            state.heartbeat_count = 0;
            return;
        }

        state.current_term += 1;
        let term = state.current_term;
        state
            .meta
            .write_current_term(term)
            .expect("failed to persist current term");
        state.status = NodeStatus::Candidate;
        state.current_leader.clear();
        state.voted_for.clear();
        state.vote_grant.clear();
        state.voted_for.insert(term, self.self_id.clone());
        state
            .meta
            .write_vote(term, &self.self_id)
            .expect("failed to persist vote");
        *state.vote_grant.entry(term).or_default() += 1;

        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        info!(
            term,
            last_log_index, last_log_term, "election timeout, broadcasting vote request"
        );
        let request = VoteRequest {
            term,
            candidate_id: self.self_id.clone(),
            last_log_index,
            last_log_term,
        };
        for peer in &self.others {
            let node = self.arc();
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                match node.transport.vote(&peer, request).await {
                    Ok(response) => node.on_vote_response(response).await,
                    Err(e) => debug!(peer = %peer, error = %e, "vote rpc failed"),
                }
            });
        }
    }

    async fn on_vote_response(&self, response: VoteResponse) {
        let mut state = self.state.lock().await;
        if state.status != NodeStatus::Candidate {
            return;
        }
        if response.vote_granted && response.term == state.current_term {
            let grants = {
                let counter = state.vote_grant.entry(response.term).or_default();
                *counter += 1;
                *counter
            };
            if 2 * grants > self.members.len() {
                self.trans_to_leader(&mut state);
            }
        } else if response.term > state.current_term {
            self.trans_to_follower(&mut state, "vote response", response.term);
        }
    }

    /// Vote RPC handler.
    pub async fn vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.state.lock().await;
        if request.term < state.current_term {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        // only candidates with a log at least as up to date may win
        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        if request.last_log_term < last_log_term
            || (request.last_log_term == last_log_term && request.last_log_index < last_log_index)
        {
            return VoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }

        if request.term > state.current_term {
            self.trans_to_follower(&mut state, "vote request", request.term);
        }

        let current_term = state.current_term;
        match state.voted_for.get(&current_term) {
            Some(candidate) if *candidate != request.candidate_id => {
                warn!(
                    term = current_term,
                    voted_for = %candidate,
                    candidate = %request.candidate_id,
                    "refusing second vote in one term"
                );
                VoteResponse {
                    term: current_term,
                    vote_granted: false,
                }
            }
            Some(_) => VoteResponse {
                term: current_term,
                vote_granted: true,
            },
            None => {
                state
                    .voted_for
                    .insert(current_term, request.candidate_id.clone());
                state
                    .meta
                    .write_vote(current_term, &request.candidate_id)
                    .expect("failed to persist vote");
                info!(term = current_term, candidate = %request.candidate_id, "granted vote");
                VoteResponse {
                    term: current_term,
                    vote_granted: true,
                }
            }
        }
    }

    // === Heartbeats ===

    async fn heartbeat_loop(self: Arc<Node>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped() {
                return;
            }
            let request = {
                let state = self.state.lock().await;
                if state.status != NodeStatus::Leader {
                    continue;
                }
                AppendEntriesRequest::heartbeat(
                    state.current_term,
                    self.self_id.clone(),
                    state.commit_index,
                )
            };
            for peer in &self.others {
                let node = self.clone();
                let peer = peer.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let deadline = node.config.elect_timeout_min;
                    if let Ok(response) =
                        node.transport.append_entries(&peer, request, deadline).await
                    {
                        let mut state = node.state.lock().await;
                        if state.status == NodeStatus::Leader
                            && response.current_term > state.current_term
                        {
                            node.trans_to_follower(
                                &mut state,
                                "heartbeat response",
                                response.current_term,
                            );
                        }
                    }
                });
            }
        }
    }

    // === Log replication ===

    /// Per-follower replicator: pushes batches while this node stays
    /// leader, probing backwards on conflicts.
    async fn replicate_log(self: Arc<Node>, follower: String) {
        info!(follower = %follower, "start replicating log");
        let mut latest_replicating_ok = true;
        'replicate: loop {
            // wait until there is something to send
            loop {
                if self.stopped() {
                    break 'replicate;
                }
                {
                    let state = self.state.lock().await;
                    if state.status != NodeStatus::Leader {
                        break 'replicate;
                    }
                    let next = state
                        .next_index
                        .get(&follower)
                        .copied()
                        .unwrap_or_else(|| self.binlog.length());
                    if self.binlog.length() > next {
                        break;
                    }
                }
                let _ = timeout(COND_WAIT, self.replication_notify.notified()).await;
            }

            let (term, commit_index, index) = {
                let state = self.state.lock().await;
                if state.status != NodeStatus::Leader {
                    break 'replicate;
                }
                (
                    state.current_term,
                    state.commit_index,
                    state.next_index[&follower],
                )
            };

            let prev_index = index - 1;
            let prev_term = if prev_index > -1 {
                match self.binlog.read_slot(prev_index) {
                    Ok(Some(entry)) => entry.term,
                    _ => {
                        error!(slot = prev_index, follower = %follower, "bad slot, cannot replicate");
                        break 'replicate;
                    }
                }
            } else {
                -1
            };

            let mut batch_span =
                (self.binlog.length() - index).min(self.config.log_rep_batch_max as i64);
            if !latest_replicating_ok {
                // slow probe until the follower accepts again
                batch_span = batch_span.min(1);
            }
            if batch_span <= 0 {
                continue;
            }
            let mut entries = Vec::with_capacity(batch_span as usize);
            let mut max_term = -1;
            for slot in index..index + batch_span {
                match self.binlog.read_slot(slot) {
                    Ok(Some(entry)) => {
                        max_term = max_term.max(entry.term);
                        entries.push(entry);
                    }
                    _ => {
                        error!(slot, follower = %follower, "bad slot, cannot replicate");
                        break 'replicate;
                    }
                }
            }

            let request = AppendEntriesRequest {
                term,
                leader_id: self.self_id.clone(),
                prev_log_index: prev_index,
                prev_log_term: prev_term,
                leader_commit_index: commit_index,
                entries,
            };
            let result = self
                .transport
                .append_entries(&follower, request, self.config.replication_rpc_timeout)
                .await;

            match result {
                Ok(response) => {
                    let mut state = self.state.lock().await;
                    if response.current_term > state.current_term {
                        self.trans_to_follower(
                            &mut state,
                            "append entries response",
                            response.current_term,
                        );
                    }
                    if state.status != NodeStatus::Leader {
                        break 'replicate;
                    }
                    if response.success {
                        state.next_index.insert(follower.clone(), index + batch_span);
                        state
                            .match_index
                            .insert(follower.clone(), index + batch_span - 1);
                        if max_term == state.current_term {
                            self.update_commit_index(&mut state, index + batch_span - 1);
                        }
                        latest_replicating_ok = true;
                    } else if response.is_busy {
                        drop(state);
                        debug!(follower = %follower, "follower busy, delaying replication");
                        sleep(self.config.replication_retry_timespan).await;
                        latest_replicating_ok = true;
                    } else {
                        // (index, term) mismatch: step back, bounded by the
                        // follower's log length
                        let rewound = (index - 1).min(response.log_length).max(0);
                        state.next_index.insert(follower.clone(), rewound);
                        info!(follower = %follower, next_index = rewound, "rewound next index");
                    }
                }
                Err(e) => {
                    warn!(follower = %follower, error = %e, "replication rpc failed");
                    sleep(self.config.replication_retry_timespan).await;
                    latest_replicating_ok = false;
                }
            }
        }
        let mut state = self.state.lock().await;
        state.replicating.remove(&follower);
        info!(follower = %follower, "replicator exits");
    }

    /// Advance the commit index to `index` if a majority matches it and
    /// the entry belongs to the current term.
    pub(crate) fn update_commit_index(&self, state: &mut NodeState, index: i64) {
        if index <= state.commit_index {
            return;
        }
        let mut match_count = 0;
        for member in &self.members {
            if *member == self.self_id
                || state.match_index.get(member).copied().unwrap_or(-1) >= index
            {
                match_count += 1;
            }
        }
        if 2 * match_count <= self.members.len() {
            return;
        }
        // never commit an entry from a previous term directly
        let entry_term = match self.binlog.read_slot(index) {
            Ok(Some(entry)) => entry.term,
            _ => return,
        };
        if entry_term != state.current_term {
            return;
        }
        state.commit_index = index;
        debug!(commit_index = index, "advanced commit index");
        self.commit_notify.notify_waiters();
    }

    /// AppendEntries RPC handler (heartbeat and replication).
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;
        if request.term < state.current_term {
            return AppendEntriesResponse {
                current_term: state.current_term,
                success: false,
                log_length: self.binlog.length(),
                is_busy: false,
            };
        }
        if state.status != NodeStatus::Follower {
            info!(old_status = %state.status, "observed a leader, becoming follower");
            state.status = NodeStatus::Follower;
        }
        if request.term > state.current_term {
            state.current_term = request.term;
            state
                .meta
                .write_current_term(request.term)
                .expect("failed to persist current term");
        }
        state.current_leader = request.leader_id.clone();
        state.heartbeat_count += 1;

        if !request.entries.is_empty() {
            if request.prev_log_index >= self.binlog.length() {
                debug!(
                    prev_log_index = request.prev_log_index,
                    log_length = self.binlog.length(),
                    "previous log index is beyond our log"
                );
                return AppendEntriesResponse {
                    current_term: state.current_term,
                    success: false,
                    log_length: self.binlog.length(),
                    is_busy: false,
                };
            }
            let prev_term = if request.prev_log_index >= 0 {
                match self.binlog.read_slot(request.prev_log_index) {
                    Ok(Some(entry)) => entry.term,
                    other => panic!(
                        "unreadable log slot {}: {other:?}",
                        request.prev_log_index
                    ),
                }
            } else {
                -1
            };
            if prev_term != request.prev_log_term {
                // divergent history: drop our conflicting tail and let the
                // leader probe further back
                self.binlog
                    .truncate(request.prev_log_index - 1)
                    .expect("failed to truncate binlog");
                info!(
                    prev_log_index = request.prev_log_index,
                    local_term = prev_term,
                    leader_term = request.prev_log_term,
                    "log term mismatch, truncated tail"
                );
                return AppendEntriesResponse {
                    current_term: state.current_term,
                    success: false,
                    log_length: self.binlog.length(),
                    is_busy: false,
                };
            }
            if state.commit_index - state.last_applied > self.config.max_commit_pending {
                debug!(
                    commit_index = state.commit_index,
                    last_applied = state.last_applied,
                    "apply backlog too large, asking leader to back off"
                );
                return AppendEntriesResponse {
                    current_term: state.current_term,
                    success: false,
                    log_length: self.binlog.length(),
                    is_busy: true,
                };
            }
            if self.binlog.length() > request.prev_log_index + 1 {
                let old_length = self.binlog.length();
                self.binlog
                    .truncate(request.prev_log_index)
                    .expect("failed to truncate binlog");
                info!(
                    old_length,
                    new_length = self.binlog.length(),
                    "aligned log tail before append"
                );
            }
            self.binlog
                .append_batch(&request.entries)
                .expect("failed to append replicated entries");
        }

        let advanced = self
            .binlog
            .last_index()
            .min(request.leader_commit_index);
        if advanced > state.commit_index {
            state.commit_index = advanced;
            self.commit_notify.notify_waiters();
        }
        AppendEntriesResponse {
            current_term: state.current_term,
            success: true,
            log_length: self.binlog.length(),
            is_busy: false,
        }
    }

    // === Apply worker ===

    async fn apply_worker(self: Arc<Node>) {
        loop {
            if self.stopped() {
                return;
            }
            let window = {
                let state = self.state.lock().await;
                if state.commit_index > state.last_applied {
                    Some((state.last_applied, state.commit_index))
                } else {
                    None
                }
            };
            let (from, to) = match window {
                Some(window) => window,
                None => {
                    let _ = timeout(COND_WAIT, self.commit_notify.notified()).await;
                    continue;
                }
            };
            debug!(from = from + 1, to, "applying committed entries");
            for index in (from + 1)..=to {
                if self.stopped() {
                    return;
                }
                let entry = match self.binlog.read_slot(index) {
                    Ok(Some(entry)) => entry,
                    other => panic!("unreadable log slot {index}: {other:?}"),
                };
                self.apply_entry(index, entry).await;
            }
        }
    }

    /// Apply one committed entry: mutate the data store without the main
    /// lock, then take it to complete the pending ack and persist the
    /// applied index. At-least-once on crash; every effect is idempotent
    /// given the stored tag.
    async fn apply_entry(&self, index: i64, entry: LogEntry) {
        let mut log_status = Status::Error;
        let mut new_uuid = String::new();
        let mut nop_term = None;

        match entry.op {
            LogOp::Put | LogOp::Lock => {
                debug!(key = %entry.key, user = %entry.user, op = ?entry.op, "apply put");
                let tagged = tag_value(entry.op, entry.value.as_bytes());
                self.store_put(&entry.user, entry.key.as_bytes(), &tagged);
                if entry.op == LogOp::Lock {
                    self.touch_parent_key(&entry.user, &entry.key, &entry.value, "lock");
                    self.session_locks
                        .lock()
                        .entry(entry.value.clone())
                        .or_default()
                        .insert(entry.key.clone());
                } else {
                    self.touch_parent_key(&entry.user, &entry.key, &entry.value, "put");
                }
                let node = self.arc();
                let bound = bind_key(&entry.user, &entry.key);
                let value = entry.value.clone();
                tokio::spawn(async move {
                    node.trigger_event_with_parent(bound, value, false).await;
                });
            }
            LogOp::Del => {
                debug!(key = %entry.key, user = %entry.user, "apply delete");
                self.store_delete(&entry.user, entry.key.as_bytes());
                self.touch_parent_key(&entry.user, &entry.key, &entry.value, "del");
                let node = self.arc();
                let bound = bind_key(&entry.user, &entry.key);
                let value = entry.value.clone();
                tokio::spawn(async move {
                    node.trigger_event_with_parent(bound, value, true).await;
                });
            }
            LogOp::Nop => {
                nop_term = Some(entry.term);
            }
            LogOp::Unlock => {
                // conditional delete: only the recorded holder is evicted
                let current = match self.data_store.get(&entry.user, entry.key.as_bytes()) {
                    Ok(value) => value,
                    Err(StoreError::UnknownUser(_)) => None,
                    Err(e) => panic!("data store read failed while applying unlock: {e}"),
                };
                if let Some(raw) = current {
                    let (op, payload) = parse_value(&raw);
                    if op == Some(LogOp::Lock) && payload == entry.value.as_bytes() {
                        self.store_delete(&entry.user, entry.key.as_bytes());
                        info!(key = %entry.key, session = %entry.value, "unlocked");
                        self.touch_parent_key(&entry.user, &entry.key, &entry.value, "unlock");
                        let node = self.arc();
                        let bound = bind_key(&entry.user, &entry.key);
                        let value = entry.value.clone();
                        tokio::spawn(async move {
                            node.trigger_event_with_parent(bound, value, true).await;
                        });
                    }
                }
            }
            LogOp::Login => {
                log_status = self.users.login(&entry.key, &entry.value, &entry.user);
                if log_status == Status::Ok {
                    new_uuid = entry.user.clone();
                    if let Err(e) = self.data_store.open_database(&entry.key) {
                        warn!(user = %entry.key, error = %e, "failed to open user namespace");
                    }
                }
            }
            LogOp::Logout => {
                log_status = self.users.logout(&entry.user);
            }
            LogOp::Register => {
                log_status = self.users.register(&entry.key, &entry.value);
            }
        }

        let mut state = self.state.lock().await;
        if let Some(term) = nop_term {
            if state.status == NodeStatus::Leader && term == state.current_term && state.in_safe_mode
            {
                state.in_safe_mode = false;
                info!("no-op of this term applied, leaving safe mode");
            }
        }
        if state.status == NodeStatus::Leader {
            if let Some(ack) = state.pending_acks.remove(&index) {
                complete_ack(ack, log_status, &new_uuid);
            }
        }
        state.last_applied += 1;
        self.data_store
            .put(
                ANONYMOUS_USER,
                TAG_LAST_APPLIED_INDEX,
                &encode_i64(state.last_applied),
            )
            .expect("failed to persist last applied index");
    }

    /// Put that lazily opens a namespace the first time the apply path
    /// touches it. Persistent failure is fatal.
    pub(crate) fn store_put(&self, user: &str, key: &[u8], value: &[u8]) {
        match self.data_store.put(user, key, value) {
            Ok(()) => {}
            Err(StoreError::UnknownUser(_)) => {
                self.data_store
                    .open_database(user)
                    .expect("failed to open namespace");
                self.data_store
                    .put(user, key, value)
                    .expect("data store put failed");
            }
            Err(e) => panic!("data store put failed: {e}"),
        }
    }

    fn store_delete(&self, user: &str, key: &[u8]) {
        match self.data_store.delete(user, key) {
            Ok(()) => {}
            Err(StoreError::UnknownUser(_)) => {
                self.data_store
                    .open_database(user)
                    .expect("failed to open namespace");
                self.data_store
                    .delete(user, key)
                    .expect("data store delete failed");
            }
            Err(e) => panic!("data store delete failed: {e}"),
        }
    }

    // === Watch plumbing ===

    /// Synthetic write on the parent key so directory-style watchers
    /// observe child changes.
    pub(crate) fn touch_parent_key(
        &self,
        user: &str,
        key: &str,
        changed_session: &str,
        action: &str,
    ) {
        if let Some(parent) = parent_key(key) {
            let value = tag_value(
                LogOp::Put,
                format!("{action},{changed_session}").as_bytes(),
            );
            self.store_put(user, parent.as_bytes(), &value);
        }
    }

    /// Fire watches on the exact key, then on its parent. A parent without
    /// watchers gets one delayed retry to close the register/notify race.
    async fn trigger_event_with_parent(self: Arc<Node>, bound_key: String, value: String, deleted: bool) {
        self.watches
            .lock()
            .fire_key(&bound_key, &bound_key, &value, deleted);
        if let Some(parent) = parent_key(&bound_key).map(str::to_string) {
            let fired = self
                .watches
                .lock()
                .fire_key(&parent, &bound_key, &value, deleted);
            if !fired {
                sleep(self.config.watch_retry_delay).await;
                self.watches
                    .lock()
                    .fire_key(&parent, &bound_key, &value, deleted);
            }
        }
    }

    pub(crate) fn is_expired_session(&self, session_id: &str) -> bool {
        !self.sessions.lock().contains(session_id)
    }

    // === Session expiry ===

    async fn session_reaper(self: Arc<Node>) {
        let mut ticker = interval(self.config.session_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped() {
                return;
            }
            self.remove_expired_sessions().await;
        }
    }

    /// Drop sessions that stopped reporting, cancel their watches, and, on
    /// the leader, turn their locks into Unlock entries (plus a Logout for
    /// their token).
    async fn remove_expired_sessions(&self) {
        let (current_term, current_status) = {
            let state = self.state.lock().await;
            (state.current_term, state.status)
        };
        let horizon = match Instant::now().checked_sub(self.config.session_expire_timeout) {
            Some(horizon) => horizon,
            None => return,
        };
        let expired = self.sessions.lock().remove_expired(horizon);
        if expired.is_empty() {
            return;
        }
        info!(count = expired.len(), "removing expired sessions");

        {
            let mut watches = self.watches.lock();
            for session in &expired {
                watches.remove_session(&session.session_id);
            }
        }

        let mut unlock_keys = Vec::new();
        {
            let mut session_locks = self.session_locks.lock();
            for session in &expired {
                if let Some(keys) = session_locks.remove(&session.session_id) {
                    for key in keys {
                        unlock_keys.push((key, session.clone()));
                    }
                }
            }
        }

        if current_status != NodeStatus::Leader {
            return;
        }
        for (key, session) in &unlock_keys {
            info!(key = %key, session = %session.session_id, "reaping expired lock");
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: self.users.username_for_uuid(&session.uuid),
                key: key.clone(),
                value: session.session_id.clone(),
                term: current_term,
            };
            self.binlog
                .append(&entry)
                .expect("failed to append unlock entry");
        }
        for session in &expired {
            if session.uuid.is_empty() {
                continue;
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: session.uuid.clone(),
                key: String::new(),
                value: String::new(),
                term: current_term,
            };
            self.binlog
                .append(&entry)
                .expect("failed to append logout entry");
        }
        self.replication_notify.notify_waiters();
        if self.single_node_mode {
            let mut state = self.state.lock().await;
            self.update_commit_index(&mut state, self.binlog.last_index());
        }
    }

    // === Binlog GC ===

    async fn gc_loop(self: Arc<Node>) {
        let mut ticker = interval(self.config.gc_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped() {
                return;
            }
            self.garbage_clean().await;
        }
    }

    /// Leader-driven: poll every member's applied index and broadcast the
    /// safe prefix deletion when it moves.
    async fn garbage_clean(&self) {
        {
            let state = self.state.lock().await;
            if state.status != NodeStatus::Leader {
                return;
            }
        }
        let mut min_applied = i64::MAX;
        for member in &self.members {
            match self
                .transport
                .show_status(member, self.config.gc_rpc_timeout)
                .await
            {
                Ok(status) => min_applied = min_applied.min(status.last_applied),
                Err(e) => {
                    debug!(member = %member, error = %e, "failed to poll applied index, skipping gc round");
                    return;
                }
            }
        }
        let safe_clean_index = min_applied - 1;
        let changed = {
            let mut state = self.state.lock().await;
            let old = state.last_safe_clean_index;
            state.last_safe_clean_index = safe_clean_index;
            old != safe_clean_index
        };
        if !changed {
            return;
        }
        info!(safe_clean_index, "broadcasting binlog clean");
        for member in &self.members {
            if let Err(e) = self
                .transport
                .clean_binlog(
                    member,
                    CleanBinlogRequest {
                        end_index: safe_clean_index,
                    },
                    self.config.gc_rpc_timeout,
                )
                .await
            {
                debug!(member = %member, error = %e, "clean binlog request failed");
            }
        }
    }

    /// CleanBinlog RPC handler: validate against the applied index, then
    /// delete the prefix in the background.
    pub async fn clean_binlog(&self, request: CleanBinlogRequest) -> CleanBinlogResponse {
        {
            let state = self.state.lock().await;
            if state.last_applied < request.end_index {
                warn!(
                    end_index = request.end_index,
                    last_applied = state.last_applied,
                    "refusing unsafe binlog clean"
                );
                return CleanBinlogResponse { success: false };
            }
        }
        let node = self.arc();
        tokio::spawn(async move {
            if let Err(e) = node.binlog.gc_prefix(request.end_index - 1) {
                warn!(error = %e, "binlog gc failed");
            }
        });
        CleanBinlogResponse { success: true }
    }

    /// ShowStatus RPC handler.
    pub async fn show_status(&self) -> ShowStatusResponse {
        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        let state = self.state.lock().await;
        ShowStatusResponse {
            status: state.status,
            term: state.current_term,
            last_log_index,
            last_log_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
        }
    }

    async fn perf_roller(self: Arc<Node>) {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped() {
                return;
            }
            self.perf.roll();
        }
    }
}
