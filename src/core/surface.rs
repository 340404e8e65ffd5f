//! Client request surface
//!
//! Admission is uniform: followers redirect to the known leader, candidates
//! redirect nowhere, a leader in safe mode refuses reads, locks and scans
//! (writes still proceed), and an unknown login token yields
//! `uuid_expired`. Writes append a log entry and park a pending ack that
//! the apply worker completes; reads take a quorum of heartbeats unless a
//! recent one is still fresh.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::rpc::types::*;
use crate::storage::data::{parse_value, tag_value, TAG_LAST_APPLIED_INDEX};
use crate::storage::{LogEntry, LogOp};

use super::node::{Node, PendingAck};
use super::session::Session;
use super::users::UserManager;
use super::watch::bind_key;

/// Cumulative key+value bytes a single scan response may carry.
const MAX_SCAN_BYTES: usize = 26 << 20;

/// Shared completion state for one quorum read.
struct ReadContext {
    request: GetRequest,
    success_count: usize,
    error_count: usize,
    reply: Option<oneshot::Sender<GetResponse>>,
}

fn read_failed() -> GetResponse {
    GetResponse {
        success: false,
        hit: false,
        value: String::new(),
        leader_id: String::new(),
        uuid_expired: false,
    }
}

impl Node {
    // === Reads ===

    /// Linearizable Get: answered locally only when a quorum heartbeat is
    /// fresh, otherwise after a round of heartbeats confirms leadership.
    pub async fn get(&self, request: GetRequest) -> GetResponse {
        self.perf.record(StatOp::Get);
        let state = self.state.lock().await;
        match state.status {
            NodeStatus::Follower => {
                return GetResponse {
                    success: false,
                    hit: false,
                    value: String::new(),
                    leader_id: state.current_leader.clone(),
                    uuid_expired: false,
                };
            }
            NodeStatus::Candidate => return read_failed(),
            NodeStatus::Leader => {}
        }
        if state.in_safe_mode {
            debug!("leader still in safe mode, refusing read");
            return read_failed();
        }
        if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
            return GetResponse {
                uuid_expired: true,
                ..read_failed()
            };
        }

        let quorum_fresh = state
            .heartbeat_read_at
            .map(|at| at.elapsed() < self.config.elect_timeout_min)
            .unwrap_or(false);
        if self.members.len() > 1 && !quorum_fresh {
            debug!(key = %request.key, "broadcasting heartbeat for read");
            let heartbeat = AppendEntriesRequest::heartbeat(
                state.current_term,
                self.self_id.clone(),
                state.commit_index,
            );
            let (reply_tx, reply_rx) = oneshot::channel();
            let context = Arc::new(parking_lot::Mutex::new(ReadContext {
                request,
                success_count: 1, // local read counts
                error_count: 0,
                reply: Some(reply_tx),
            }));
            for peer in &self.others {
                let node = self.arc();
                let peer = peer.clone();
                let heartbeat = heartbeat.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    node.heartbeat_for_read(peer, heartbeat, context).await;
                });
            }
            drop(state);
            reply_rx.await.unwrap_or_else(|_| read_failed())
        } else {
            self.local_get(&request)
        }
    }

    async fn heartbeat_for_read(
        &self,
        peer: String,
        request: AppendEntriesRequest,
        context: Arc<parking_lot::Mutex<ReadContext>>,
    ) {
        let result = self
            .transport
            .append_entries(&peer, request, self.config.replication_rpc_timeout)
            .await;
        let mut state = self.state.lock().await;
        let mut context = context.lock();
        if context.reply.is_none() {
            return;
        }
        if state.status != NodeStatus::Leader {
            if let Some(reply) = context.reply.take() {
                let _ = reply.send(read_failed());
            }
            return;
        }
        match result {
            Ok(response) if response.current_term > state.current_term => {
                self.trans_to_follower(&mut state, "read heartbeat", response.current_term);
                if let Some(reply) = context.reply.take() {
                    let _ = reply.send(read_failed());
                }
            }
            Ok(_) => {
                context.success_count += 1;
                if context.success_count > self.members.len() / 2 {
                    let request = context.request.clone();
                    let response = self.local_get(&request);
                    if let Some(reply) = context.reply.take() {
                        let _ = reply.send(response);
                    }
                    state.heartbeat_read_at = Some(Instant::now());
                }
            }
            Err(_) => {
                context.error_count += 1;
                if context.error_count > self.members.len() / 2 {
                    if let Some(reply) = context.reply.take() {
                        let _ = reply.send(read_failed());
                    }
                }
            }
        }
    }

    /// Read straight from the local store. A lock whose session has
    /// expired reads as a miss.
    fn local_get(&self, request: &GetRequest) -> GetResponse {
        let user = self.users.username_for_uuid(&request.uuid);
        match self.data_store.get(&user, request.key.as_bytes()) {
            Ok(Some(raw)) => {
                let (op, payload) = parse_value(&raw);
                let value = String::from_utf8_lossy(payload).into_owned();
                if op == Some(LogOp::Lock) && self.is_expired_session(&value) {
                    GetResponse {
                        success: true,
                        hit: false,
                        value: String::new(),
                        leader_id: String::new(),
                        uuid_expired: false,
                    }
                } else {
                    GetResponse {
                        success: true,
                        hit: true,
                        value,
                        leader_id: String::new(),
                        uuid_expired: false,
                    }
                }
            }
            _ => GetResponse {
                success: true,
                hit: false,
                value: String::new(),
                leader_id: String::new(),
                uuid_expired: false,
            },
        }
    }

    // === Writes ===

    /// Put: append and wait for apply.
    pub async fn put(&self, request: PutRequest) -> PutResponse {
        self.perf.record(StatOp::Put);
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return PutResponse {
                        success: false,
                        leader_id: state.current_leader.clone(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Candidate => {
                    return PutResponse {
                        success: false,
                        leader_id: String::new(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Leader => {}
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                warn!(
                    pending = state.pending_acks.len(),
                    "too many pending writes"
                );
                return PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return PutResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            let entry = LogEntry {
                op: LogOp::Put,
                user: self.users.username_for_uuid(&request.uuid),
                key: request.key,
                value: request.value,
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Put(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                // leadership was lost before the entry applied
                let state = self.state.lock().await;
                PutResponse {
                    success: false,
                    leader_id: state.current_leader.clone(),
                    uuid_expired: false,
                }
            }
        }
    }

    /// Delete: append and wait for apply. Deleting a missing key succeeds.
    pub async fn delete(&self, request: DelRequest) -> DelResponse {
        self.perf.record(StatOp::Delete);
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return DelResponse {
                        success: false,
                        leader_id: state.current_leader.clone(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Candidate => {
                    return DelResponse {
                        success: false,
                        leader_id: String::new(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Leader => {}
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                return DelResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return DelResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            let entry = LogEntry {
                op: LogOp::Del,
                user: self.users.username_for_uuid(&request.uuid),
                key: request.key,
                value: String::new(),
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Del(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                DelResponse {
                    success: false,
                    leader_id: state.current_leader.clone(),
                    uuid_expired: false,
                }
            }
        }
    }

    // === Locks ===

    /// Grant rule: the key is free and the caller's session is live, or
    /// the recorded holder's session has expired, or the caller already
    /// holds it (reentrant).
    fn lock_is_available(&self, user: &str, key: &str, session_id: &str) -> bool {
        let current = match self.data_store.get(user, key.as_bytes()) {
            Ok(value) => value,
            Err(_) => None,
        };
        match current {
            None => self.sessions.lock().contains(session_id),
            Some(raw) => {
                let (op, payload) = parse_value(&raw);
                if op != Some(LogOp::Lock) {
                    return false;
                }
                let holder = String::from_utf8_lossy(payload).into_owned();
                let sessions = self.sessions.lock();
                let holder_alive = sessions.contains(&holder);
                let caller_alive = sessions.contains(session_id);
                (!holder_alive && caller_alive) || (holder_alive && holder == session_id)
            }
        }
    }

    /// Lock: check availability, place the owning value optimistically,
    /// then append the Lock entry (the apply path re-writes the same
    /// bytes, so re-apply is a no-op).
    pub async fn lock(&self, request: LockRequest) -> LockResponse {
        self.perf.record(StatOp::Lock);
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return LockResponse {
                        success: false,
                        leader_id: state.current_leader.clone(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Candidate => {
                    return LockResponse {
                        success: false,
                        leader_id: String::new(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Leader => {}
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            if state.in_safe_mode {
                debug!("leader still in safe mode, refusing lock");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            // until a full expiry window has passed, the session table may
            // still miss holders that are actually alive
            if self.start_time.elapsed() < self.config.session_expire_timeout {
                debug!("session table still warming up, refusing lock");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            let user = self.users.username_for_uuid(&request.uuid);
            if !self.lock_is_available(&user, &request.key, &request.session_id) {
                info!(key = %request.key, session = %request.session_id, "lock is held by another session");
                return LockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            info!(key = %request.key, session = %request.session_id, "granting lock");
            let tagged = tag_value(LogOp::Lock, request.session_id.as_bytes());
            self.store_put(&user, request.key.as_bytes(), &tagged);
            let entry = LogEntry {
                op: LogOp::Lock,
                user,
                key: request.key,
                value: request.session_id,
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Lock(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                LockResponse {
                    success: false,
                    leader_id: state.current_leader.clone(),
                    uuid_expired: false,
                }
            }
        }
    }

    /// Unlock: append the conditional delete and wait for apply.
    pub async fn unlock(&self, request: UnlockRequest) -> UnlockResponse {
        self.perf.record(StatOp::Unlock);
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return UnlockResponse {
                        success: false,
                        leader_id: state.current_leader.clone(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Candidate => {
                    return UnlockResponse {
                        success: false,
                        leader_id: String::new(),
                        uuid_expired: false,
                    };
                }
                NodeStatus::Leader => {}
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return UnlockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: true,
                };
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                return UnlockResponse {
                    success: false,
                    leader_id: String::new(),
                    uuid_expired: false,
                };
            }
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: self.users.username_for_uuid(&request.uuid),
                key: request.key,
                value: request.session_id,
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Unlock(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                UnlockResponse {
                    success: false,
                    leader_id: state.current_leader.clone(),
                    uuid_expired: false,
                }
            }
        }
    }

    // === Scan ===

    pub async fn scan(&self, request: ScanRequest) -> ScanResponse {
        self.perf.record(StatOp::Scan);
        let fail = |leader_id: String| ScanResponse {
            success: false,
            leader_id,
            items: Vec::new(),
            has_more: false,
            uuid_expired: false,
        };
        {
            let state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => return fail(state.current_leader.clone()),
                NodeStatus::Candidate => return fail(String::new()),
                NodeStatus::Leader => {}
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return ScanResponse {
                    uuid_expired: true,
                    ..fail(String::new())
                };
            }
            if state.in_safe_mode {
                debug!("leader still in safe mode, refusing scan");
                return fail(String::new());
            }
            if self.start_time.elapsed() < self.config.session_expire_timeout {
                debug!("session table still warming up, refusing scan");
                return fail(String::new());
            }
        }

        let user = self.users.username_for_uuid(&request.uuid);
        let db = match self.data_store.find_db(&user) {
            Ok(db) => db,
            Err(_) => {
                return ScanResponse {
                    success: true,
                    leader_id: String::new(),
                    items: Vec::new(),
                    has_more: false,
                    uuid_expired: true,
                };
            }
        };
        let iter = match db.scan_from(request.start_key.as_bytes()) {
            Ok(iter) => iter,
            Err(e) => {
                warn!(error = %e, "scan failed");
                return fail(String::new());
            }
        };

        let mut items = Vec::new();
        let mut has_more = false;
        let mut payload_bytes = 0usize;
        for item in iter {
            let (key, raw) = match item {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "scan failed mid-iteration");
                    return fail(String::new());
                }
            };
            if !request.end_key.is_empty() && key.as_slice() >= request.end_key.as_bytes() {
                break;
            }
            if key == TAG_LAST_APPLIED_INDEX {
                continue;
            }
            let (op, payload) = parse_value(&raw);
            let value = String::from_utf8_lossy(payload).into_owned();
            if op == Some(LogOp::Lock) && self.is_expired_session(&value) {
                continue;
            }
            if items.len() >= request.size_limit || payload_bytes > MAX_SCAN_BYTES {
                has_more = true;
                break;
            }
            payload_bytes += key.len() + value.len();
            items.push(ScanItem {
                key: String::from_utf8_lossy(&key).into_owned(),
                value,
            });
        }
        ScanResponse {
            success: true,
            leader_id: String::new(),
            items,
            has_more,
            uuid_expired: false,
        }
    }

    // === Watch ===

    /// Register a one-shot watch and hold the response until it fires.
    pub async fn watch(&self, request: WatchRequest) -> WatchResponse {
        self.perf.record(StatOp::Watch);
        {
            let state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return WatchResponse {
                        leader_id: state.current_leader.clone(),
                        ..WatchResponse::default()
                    };
                }
                NodeStatus::Candidate => return WatchResponse::default(),
                NodeStatus::Leader => {}
            }
            if state.in_safe_mode {
                debug!("leader still in safe mode, refusing watch");
                return WatchResponse::default();
            }
        }
        if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
            return WatchResponse {
                uuid_expired: true,
                ..WatchResponse::default()
            };
        }

        let user = self.users.username_for_uuid(&request.uuid);
        let bound = bind_key(&user, &request.key);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.watches
            .lock()
            .register(bound.clone(), request.session_id.clone(), reply_tx);

        // the registration may already be stale against the live store;
        // re-read and fire immediately on any difference
        if self.start_time.elapsed() > self.config.session_expire_timeout {
            let current = match self.data_store.get(&user, request.key.as_bytes()) {
                Ok(value) => value,
                Err(_) => None,
            };
            let key_exist = current.is_some();
            let (op, value) = match &current {
                Some(raw) => {
                    let (op, payload) = parse_value(raw);
                    (op, String::from_utf8_lossy(payload).into_owned())
                }
                None => (None, String::new()),
            };
            if value != request.old_value || key_exist != request.key_exist {
                debug!(key = %request.key, "watch registered against a stale value, firing");
                self.watches.lock().fire_session_key(
                    &request.session_id,
                    &bound,
                    &value,
                    !key_exist,
                );
            } else if op == Some(LogOp::Lock) && self.is_expired_session(&value) {
                self.watches
                    .lock()
                    .fire_session_key(&request.session_id, &bound, "", true);
            }
        }

        reply_rx.await.unwrap_or_else(|_| WatchResponse {
            canceled: true,
            ..WatchResponse::default()
        })
    }

    // === Sessions ===

    /// KeepAlive: upsert the session and replace its lock set. Served on
    /// any node when forwarded by the leader; the leader fans it out so
    /// follower session tables stay identical.
    pub async fn keep_alive(&self, request: KeepAliveRequest) -> KeepAliveResponse {
        self.perf.record(StatOp::KeepAlive);
        {
            let state = self.state.lock().await;
            if state.status == NodeStatus::Follower && !request.forward_from_leader {
                return KeepAliveResponse {
                    success: false,
                    leader_id: state.current_leader.clone(),
                };
            }
            if state.status == NodeStatus::Candidate && !request.forward_from_leader {
                return KeepAliveResponse {
                    success: false,
                    leader_id: String::new(),
                };
            }
        }
        self.sessions.lock().upsert(Session {
            session_id: request.session_id.clone(),
            last_report: Instant::now(),
            uuid: request.uuid.clone(),
        });
        {
            let mut session_locks = self.session_locks.lock();
            let keys = session_locks.entry(request.session_id.clone()).or_default();
            keys.clear();
            keys.extend(request.locks.iter().cloned());
        }
        debug!(session = %request.session_id, "session reported");
        self.forward_keep_alive(request).await;
        KeepAliveResponse {
            success: true,
            leader_id: String::new(),
        }
    }

    /// Fire-and-forget fan-out of a client heartbeat to the followers.
    async fn forward_keep_alive(&self, request: KeepAliveRequest) {
        {
            let state = self.state.lock().await;
            if state.status != NodeStatus::Leader {
                return;
            }
        }
        for peer in &self.others {
            let node = self.arc();
            let peer = peer.clone();
            let mut forwarded = request.clone();
            forwarded.forward_from_leader = true;
            tokio::spawn(async move {
                if let Err(e) = node.transport.keep_alive(&peer, forwarded).await {
                    debug!(peer = %peer, error = %e, "keep-alive forward failed");
                }
            });
        }
    }

    // === Accounts ===

    pub async fn login(&self, request: LoginRequest) -> LoginResponse {
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return LoginResponse {
                        status: Status::Error,
                        uuid: String::new(),
                        leader_id: state.current_leader.clone(),
                    };
                }
                NodeStatus::Candidate => {
                    return LoginResponse {
                        status: Status::Error,
                        uuid: String::new(),
                        leader_id: String::new(),
                    };
                }
                NodeStatus::Leader => {}
            }
            if !self.users.is_valid_user(&request.username) {
                return LoginResponse {
                    status: Status::UnknownUser,
                    uuid: String::new(),
                    leader_id: String::new(),
                };
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                return LoginResponse {
                    status: Status::Busy,
                    uuid: String::new(),
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Login,
                user: UserManager::calc_uuid(&request.username),
                key: request.username,
                value: request.passwd,
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Login(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                LoginResponse {
                    status: Status::Error,
                    uuid: String::new(),
                    leader_id: state.current_leader.clone(),
                }
            }
        }
    }

    pub async fn logout(&self, request: LogoutRequest) -> LogoutResponse {
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return LogoutResponse {
                        status: Status::Error,
                        leader_id: state.current_leader.clone(),
                    };
                }
                NodeStatus::Candidate => {
                    return LogoutResponse {
                        status: Status::Error,
                        leader_id: String::new(),
                    };
                }
                NodeStatus::Leader => {}
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return LogoutResponse {
                    status: Status::UnknownUser,
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: request.uuid,
                key: String::new(),
                value: String::new(),
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state.pending_acks.insert(index, PendingAck::Logout(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                LogoutResponse {
                    status: Status::Error,
                    leader_id: state.current_leader.clone(),
                }
            }
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> RegisterResponse {
        let reply_rx = {
            let mut state = self.state.lock().await;
            match state.status {
                NodeStatus::Follower => {
                    return RegisterResponse {
                        status: Status::Error,
                        leader_id: state.current_leader.clone(),
                    };
                }
                NodeStatus::Candidate => {
                    return RegisterResponse {
                        status: Status::Error,
                        leader_id: String::new(),
                    };
                }
                NodeStatus::Leader => {}
            }
            if state.pending_acks.len() > self.config.max_write_pending {
                return RegisterResponse {
                    status: Status::Busy,
                    leader_id: String::new(),
                };
            }
            let entry = LogEntry {
                op: LogOp::Register,
                user: String::new(),
                key: request.username,
                value: request.passwd,
                term: state.current_term,
            };
            let index = self.binlog.append(&entry).expect("failed to append log entry");
            let (reply_tx, reply_rx) = oneshot::channel();
            state
                .pending_acks
                .insert(index, PendingAck::Register(reply_tx));
            self.replication_notify.notify_waiters();
            if self.single_node_mode {
                self.update_commit_index(&mut state, self.binlog.last_index());
            }
            reply_rx
        };
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => {
                let state = self.state.lock().await;
                RegisterResponse {
                    status: Status::Error,
                    leader_id: state.current_leader.clone(),
                }
            }
        }
    }

    // === Stats ===

    pub async fn rpc_stat(&self, request: RpcStatRequest) -> RpcStatResponse {
        let ops = if request.op.is_empty() {
            StatOp::ALL.to_vec()
        } else {
            request.op
        };
        let stats = ops
            .iter()
            .map(|op| StatInfo {
                current_stat: self.perf.current(*op),
                average_stat: self.perf.average(*op),
            })
            .collect();
        let state = self.state.lock().await;
        RpcStatResponse {
            stats,
            status: state.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::NodeConfig;
    use crate::rpc::inmemory::{serve_node, wire_cluster};
    use crate::testing::mem_parts;
    use std::time::Duration;

    /// Single-node cluster backed by in-memory stores; writes commit
    /// synchronously. The expiry window is kept short so the lock/scan
    /// warm-up gate opens quickly, and the reaper is pushed out so
    /// sessions stay live for the whole test.
    async fn single_node(dir: &std::path::Path) -> Arc<Node> {
        let endpoint = "127.0.0.1:7100".to_string();
        let (mut transports, mut receivers) = wire_cluster(&[endpoint.clone()]);
        let config = NodeConfig::default()
            .with_session_expire_timeout(Duration::from_millis(200))
            .with_session_check_interval(Duration::from_secs(600));
        let node = Node::start(
            config,
            endpoint.clone(),
            vec![endpoint.clone()],
            mem_parts(dir),
            Arc::new(transports.remove(&endpoint).unwrap()),
        )
        .unwrap();
        let _serve = serve_node(node.clone(), receivers.remove(&endpoint).unwrap());
        // wait for single-node leadership
        for _ in 0..100 {
            if node.show_status().await.status == NodeStatus::Leader {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // let the session-table warm-up window pass
        tokio::time::sleep(Duration::from_millis(250)).await;
        node
    }

    async fn keep_alive(node: &Arc<Node>, session: &str) {
        let response = node
            .keep_alive(KeepAliveRequest {
                session_id: session.to_string(),
                uuid: String::new(),
                locks: Vec::new(),
                forward_from_leader: false,
            })
            .await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;

        let response = node
            .put(PutRequest {
                key: "x".to_string(),
                value: "1".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        assert!(response.leader_id.is_empty());

        let response = node
            .get(GetRequest {
                key: "x".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        assert!(response.hit);
        assert_eq!(response.value, "1");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_then_get_misses() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        node.put(PutRequest {
            key: "x".to_string(),
            value: "1".to_string(),
            uuid: String::new(),
        })
        .await;
        let response = node
            .delete(DelRequest {
                key: "x".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        let response = node
            .get(GetRequest {
                key: "x".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        assert!(!response.hit);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_reentrant_and_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        keep_alive(&node, "s1").await;
        keep_alive(&node, "s2").await;

        let lock = |key: &str, session: &str| LockRequest {
            key: key.to_string(),
            session_id: session.to_string(),
            uuid: String::new(),
        };
        assert!(node.lock(lock("k", "s1")).await.success);
        // reentrant
        assert!(node.lock(lock("k", "s1")).await.success);
        // exclusive against a live session
        assert!(!node.lock(lock("k", "s2")).await.success);

        // unlock by the holder frees it
        assert!(
            node.unlock(UnlockRequest {
                key: "k".to_string(),
                session_id: "s1".to_string(),
                uuid: String::new(),
            })
            .await
            .success
        );
        assert!(node.lock(lock("k", "s2")).await.success);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_requires_live_session() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        // no KeepAlive for this session
        let response = node
            .lock(LockRequest {
                key: "k".to_string(),
                session_id: "ghost".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!response.success);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_scan_skips_bookkeeping_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            node.put(PutRequest {
                key: key.to_string(),
                value: value.to_string(),
                uuid: String::new(),
            })
            .await;
        }
        let response = node
            .scan(ScanRequest {
                start_key: "a".to_string(),
                end_key: "d".to_string(),
                size_limit: 2,
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        assert_eq!(response.items.len(), 2);
        assert!(response.has_more);
        assert_eq!(response.items[0].key, "a");
        assert_eq!(response.items[1].key, "b");

        let response = node
            .scan(ScanRequest {
                start_key: String::new(),
                end_key: String::new(),
                size_limit: 100,
                uuid: String::new(),
            })
            .await;
        assert_eq!(response.items.len(), 4);
        assert!(!response.has_more);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_fires_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        keep_alive(&node, "s1").await;

        let watcher = {
            let node = node.clone();
            tokio::spawn(async move {
                node.watch(WatchRequest {
                    key: "a/b".to_string(),
                    session_id: "s1".to_string(),
                    old_value: String::new(),
                    key_exist: false,
                    uuid: String::new(),
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.put(PutRequest {
            key: "a/b".to_string(),
            value: "v".to_string(),
            uuid: String::new(),
        })
        .await;

        let response = watcher.await.unwrap();
        assert!(response.success);
        assert_eq!(response.watch_key, "a/b");
        assert_eq!(response.key, "a/b");
        assert_eq!(response.value, "v");
        assert!(!response.deleted);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_fires_immediately_on_stale_registration() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        keep_alive(&node, "s1").await;
        node.put(PutRequest {
            key: "k".to_string(),
            value: "current".to_string(),
            uuid: String::new(),
        })
        .await;

        // client believes the key does not exist yet
        let response = node
            .watch(WatchRequest {
                key: "k".to_string(),
                session_id: "s1".to_string(),
                old_value: String::new(),
                key_exist: false,
                uuid: String::new(),
            })
            .await;
        assert!(response.success);
        assert_eq!(response.value, "current");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_parent_watch_sees_child_change() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        keep_alive(&node, "s1").await;

        let watcher = {
            let node = node.clone();
            tokio::spawn(async move {
                node.watch(WatchRequest {
                    key: "a".to_string(),
                    session_id: "s1".to_string(),
                    old_value: String::new(),
                    key_exist: false,
                    uuid: String::new(),
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.put(PutRequest {
            key: "a/b".to_string(),
            value: "v".to_string(),
            uuid: String::new(),
        })
        .await;

        let response = watcher.await.unwrap();
        assert!(response.success);
        assert_eq!(response.watch_key, "a");
        assert_eq!(response.key, "a/b");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_login_logout_flow() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;

        let response = node
            .register(RegisterRequest {
                username: "alice".to_string(),
                passwd: "pw".to_string(),
            })
            .await;
        assert_eq!(response.status, Status::Ok);

        let response = node
            .login(LoginRequest {
                username: "alice".to_string(),
                passwd: "pw".to_string(),
            })
            .await;
        assert_eq!(response.status, Status::Ok);
        let uuid = response.uuid;
        assert!(!uuid.is_empty());

        // authorized write lands in the user's namespace
        let response = node
            .put(PutRequest {
                key: "k".to_string(),
                value: "v".to_string(),
                uuid: uuid.clone(),
            })
            .await;
        assert!(response.success);
        let response = node
            .get(GetRequest {
                key: "k".to_string(),
                uuid: uuid.clone(),
            })
            .await;
        assert!(response.hit);
        // the anonymous namespace does not see it
        let response = node
            .get(GetRequest {
                key: "k".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!response.hit);

        let response = node.logout(LogoutRequest { uuid: uuid.clone() }).await;
        assert_eq!(response.status, Status::Ok);

        // the token is dead now
        let response = node
            .put(PutRequest {
                key: "k".to_string(),
                value: "v".to_string(),
                uuid,
            })
            .await;
        assert!(!response.success);
        assert!(response.uuid_expired);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_login_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        let response = node
            .login(LoginRequest {
                username: "nobody".to_string(),
                passwd: "pw".to_string(),
            })
            .await;
        assert_eq!(response.status, Status::UnknownUser);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_redirects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = "127.0.0.1:7200".to_string();
        let peer = "127.0.0.1:7201".to_string();
        let (mut transports, _receivers) = wire_cluster(&[endpoint.clone(), peer.clone()]);
        let config = NodeConfig::default()
            .with_election_timeout(Duration::from_secs(100), Duration::from_secs(101));
        let node = Node::start(
            config,
            endpoint.clone(),
            vec![endpoint.clone(), peer.clone()],
            mem_parts(dir.path()),
            Arc::new(transports.remove(&endpoint).unwrap()),
        )
        .unwrap();

        // teach the follower who the leader is
        node.append_entries(AppendEntriesRequest::heartbeat(1, peer.clone(), -1))
            .await;

        let response = node
            .put(PutRequest {
                key: "k".to_string(),
                value: "v".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.leader_id, peer);

        let response = node
            .get(GetRequest {
                key: "k".to_string(),
                uuid: String::new(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.leader_id, peer);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_stat_counts_requests() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path()).await;
        for _ in 0..3 {
            node.get(GetRequest {
                key: "k".to_string(),
                uuid: String::new(),
            })
            .await;
        }
        let response = node.rpc_stat(RpcStatRequest { op: vec![StatOp::Get] }).await;
        assert_eq!(response.stats.len(), 1);
        assert!(response.stats[0].average_stat >= 1);
        assert_eq!(response.status, NodeStatus::Leader);
        node.shutdown().await;
    }
}
