//! One-shot watch registrations
//!
//! A watch is a held client response that fires when the watched key
//! changes or the owning session dies. Registrations are indexed by the
//! namespaced key and by session id; removal always maintains both views.
//! Fired registrations are removed (one-shot).

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::info;

use crate::rpc::types::WatchResponse;

/// Join a namespace and a key into the internal watch key.
pub fn bind_key(user: &str, key: &str) -> String {
    format!("{user}::{key}")
}

/// Strip the namespace prefix from an internal watch key.
pub fn event_key(bound: &str) -> &str {
    match bound.find("::") {
        Some(pos) => &bound[pos + 2..],
        None => bound,
    }
}

/// Parent of a path-like key: everything before the last `/`.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rfind('/').map(|pos| &key[..pos])
}

struct WatchEvent {
    key: String,
    session_id: String,
    reply: oneshot::Sender<WatchResponse>,
}

/// Registry of pending watches.
#[derive(Default)]
pub struct WatchRegistry {
    next_id: u64,
    events: HashMap<u64, WatchEvent>,
    by_key: HashMap<String, Vec<u64>>,
    by_session: HashMap<String, Vec<u64>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        WatchRegistry::default()
    }

    /// Register a watch on `key` (already namespaced) for `session_id`.
    /// A prior watch by the same session on the same key is canceled.
    pub fn register(
        &mut self,
        key: String,
        session_id: String,
        reply: oneshot::Sender<WatchResponse>,
    ) {
        self.cancel(&session_id, &key);
        let id = self.next_id;
        self.next_id += 1;
        self.by_key.entry(key.clone()).or_default().push(id);
        self.by_session
            .entry(session_id.clone())
            .or_default()
            .push(id);
        self.events.insert(
            id,
            WatchEvent {
                key,
                session_id,
                reply,
            },
        );
    }

    /// Fire every watch registered on exactly `watch_key`. Returns whether
    /// any watcher was present.
    pub fn fire_key(&mut self, watch_key: &str, key: &str, value: &str, deleted: bool) -> bool {
        let ids = match self.by_key.remove(watch_key) {
            Some(ids) => ids,
            None => return false,
        };
        let count = ids.len();
        for id in ids {
            if let Some(event) = self.take(id) {
                let _ = event.reply.send(triggered(watch_key, key, value, deleted));
            }
        }
        info!(watch_key = %event_key(watch_key), count, "fired watch");
        true
    }

    /// Fire the single watch held by `session_id` on `key`, if any.
    pub fn fire_session_key(&mut self, session_id: &str, key: &str, value: &str, deleted: bool) {
        let ids: Vec<u64> = self
            .by_session
            .get(session_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            let matches = self
                .events
                .get(&id)
                .map(|event| event.key == key)
                .unwrap_or(false);
            if matches {
                if let Some(event) = self.take(id) {
                    let _ = event.reply.send(triggered(key, key, value, deleted));
                }
            }
        }
    }

    /// Cancel a (session, key) watch, completing it with `canceled = true`.
    fn cancel(&mut self, session_id: &str, key: &str) {
        let ids: Vec<u64> = self
            .by_session
            .get(session_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            let matches = self
                .events
                .get(&id)
                .map(|event| event.key == key)
                .unwrap_or(false);
            if matches {
                if let Some(event) = self.take(id) {
                    let _ = event.reply.send(canceled());
                }
            }
        }
    }

    /// Drop every watch owned by a dead session, completing each with
    /// `canceled = true`.
    pub fn remove_session(&mut self, session_id: &str) {
        let ids = match self.by_session.remove(session_id) {
            Some(ids) => ids,
            None => return,
        };
        for id in ids {
            if let Some(event) = self.events.remove(&id) {
                if let Some(peers) = self.by_key.get_mut(&event.key) {
                    peers.retain(|other| *other != id);
                    if peers.is_empty() {
                        self.by_key.remove(&event.key);
                    }
                }
                let _ = event.reply.send(canceled());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remove an event from the table and both indices.
    fn take(&mut self, id: u64) -> Option<WatchEvent> {
        let event = self.events.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&event.key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_key.remove(&event.key);
            }
        }
        if let Some(ids) = self.by_session.get_mut(&event.session_id) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_session.remove(&event.session_id);
            }
        }
        Some(event)
    }
}

fn triggered(watch_key: &str, key: &str, value: &str, deleted: bool) -> WatchResponse {
    WatchResponse {
        watch_key: event_key(watch_key).to_string(),
        key: event_key(key).to_string(),
        value: value.to_string(),
        deleted,
        canceled: false,
        success: true,
        leader_id: String::new(),
        uuid_expired: false,
    }
}

fn canceled() -> WatchResponse {
    WatchResponse {
        canceled: true,
        ..WatchResponse::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &mut WatchRegistry, key: &str, session: &str) -> oneshot::Receiver<WatchResponse> {
        let (tx, rx) = oneshot::channel();
        registry.register(key.to_string(), session.to_string(), tx);
        rx
    }

    #[test]
    fn test_key_binding() {
        assert_eq!(bind_key("alice", "a/b"), "alice::a/b");
        assert_eq!(event_key("alice::a/b"), "a/b");
        assert_eq!(event_key("::a"), "a");
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_key("a/b"), Some("a"));
        assert_eq!(parent_key("plain"), None);
    }

    #[test]
    fn test_fire_exact_key_is_one_shot() {
        let mut registry = WatchRegistry::new();
        let rx = register(&mut registry, "::a/b", "s1");

        assert!(registry.fire_key("::a/b", "::a/b", "v", false));
        let response = rx.blocking_recv().unwrap();
        assert!(response.success);
        assert_eq!(response.watch_key, "a/b");
        assert_eq!(response.value, "v");
        assert!(!response.deleted);

        // one-shot: nothing left to fire
        assert!(!registry.fire_key("::a/b", "::a/b", "v2", false));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fire_reaches_every_watcher_of_key() {
        let mut registry = WatchRegistry::new();
        let rx1 = register(&mut registry, "::k", "s1");
        let rx2 = register(&mut registry, "::k", "s2");

        assert!(registry.fire_key("::k", "::k", "v", false));
        assert!(rx1.blocking_recv().unwrap().success);
        assert!(rx2.blocking_recv().unwrap().success);
    }

    #[test]
    fn test_reregister_cancels_previous() {
        let mut registry = WatchRegistry::new();
        let rx_old = register(&mut registry, "::k", "s1");
        let rx_new = register(&mut registry, "::k", "s1");

        let response = rx_old.blocking_recv().unwrap();
        assert!(response.canceled);
        assert_eq!(registry.len(), 1);

        registry.fire_key("::k", "::k", "v", false);
        assert!(rx_new.blocking_recv().unwrap().success);
    }

    #[test]
    fn test_remove_session_cancels_and_cleans_both_indices() {
        let mut registry = WatchRegistry::new();
        let rx1 = register(&mut registry, "::a", "dead");
        let rx2 = register(&mut registry, "::b", "dead");
        let rx3 = register(&mut registry, "::a", "alive");

        registry.remove_session("dead");
        assert!(rx1.blocking_recv().unwrap().canceled);
        assert!(rx2.blocking_recv().unwrap().canceled);
        assert_eq!(registry.len(), 1);

        // the survivor on the same key still fires
        assert!(registry.fire_key("::a", "::a", "v", false));
        assert!(rx3.blocking_recv().unwrap().success);
    }

    #[test]
    fn test_fire_session_key() {
        let mut registry = WatchRegistry::new();
        let rx1 = register(&mut registry, "::k", "s1");
        let _rx2 = register(&mut registry, "::k", "s2");

        registry.fire_session_key("s1", "::k", "", true);
        let response = rx1.blocking_recv().unwrap();
        assert!(response.deleted);
        assert_eq!(registry.len(), 1);
    }
}
