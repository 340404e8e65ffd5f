//! Application data store: per-namespace ordered databases
//!
//! Every user namespace is its own database, opened lazily the first time
//! the log application path touches it. The anonymous namespace (empty
//! name) always exists and carries node bookkeeping such as the
//! last-applied-index tag.
//!
//! Values written by the application layer carry a one-byte tag (the log op
//! that produced them) so readers can tell locks from ordinary values.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::binlog::LogOp;
use super::{OrderedStore, StoreError, StoreResult};

/// Name of the anonymous namespace.
pub const ANONYMOUS_USER: &str = "";

/// Bookkeeping key in the anonymous namespace holding the highest applied
/// log index.
pub const TAG_LAST_APPLIED_INDEX: &[u8] = b"#TAG_LAST_APPLIED_INDEX#";

/// Prefix a payload with its op tag for storage.
pub fn tag_value(op: LogOp, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(op as u8);
    out.extend_from_slice(payload);
    out
}

/// Split a stored value into `(op, payload)`. Empty or untaggable values
/// come back with no op.
pub fn parse_value(raw: &[u8]) -> (Option<LogOp>, &[u8]) {
    match raw.split_first() {
        Some((tag, payload)) => (LogOp::from_u8(*tag), payload),
        None => (None, raw),
    }
}

/// Opens the backing store for a namespace; lets tests substitute
/// `MemStore` for the on-disk backend.
pub type StoreOpener = Arc<dyn Fn(&str) -> StoreResult<Arc<dyn OrderedStore>> + Send + Sync>;

/// Per-namespace ordered databases, opened lazily.
pub struct DataStore {
    dbs: Mutex<HashMap<String, Arc<dyn OrderedStore>>>,
    opener: StoreOpener,
}

impl DataStore {
    /// Create the store and eagerly open the anonymous namespace.
    pub fn open(opener: StoreOpener) -> StoreResult<DataStore> {
        let default_db = opener(ANONYMOUS_USER)?;
        let mut dbs: HashMap<String, Arc<dyn OrderedStore>> = HashMap::new();
        dbs.insert(ANONYMOUS_USER.to_string(), default_db);
        Ok(DataStore {
            dbs: Mutex::new(dbs),
            opener,
        })
    }

    /// Open (or create) a namespace. Idempotent.
    pub fn open_database(&self, name: &str) -> StoreResult<()> {
        if self.dbs.lock().contains_key(name) {
            return Ok(());
        }
        // open outside the table lock; opening can hit the disk
        let db = (self.opener)(name)?;
        info!(namespace = %name, "opened database");
        self.dbs.lock().entry(name.to_string()).or_insert(db);
        Ok(())
    }

    /// Handle to a namespace. `UnknownUser` if it was never opened.
    pub fn find_db(&self, name: &str) -> StoreResult<Arc<dyn OrderedStore>> {
        self.dbs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownUser(name.to_string()))
    }

    pub fn get(&self, name: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.find_db(name)?.get(key)
    }

    pub fn put(&self, name: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.find_db(name)?.put(key, value)
    }

    /// Delete a key. Succeeds even if the key is absent.
    pub fn delete(&self, name: &str, key: &[u8]) -> StoreResult<()> {
        self.find_db(name)?.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn mem_data_store() -> DataStore {
        DataStore::open(Arc::new(|_name: &str| {
            Ok(Arc::new(MemStore::new()) as Arc<dyn OrderedStore>)
        }))
        .unwrap()
    }

    #[test]
    fn test_anonymous_namespace_always_open() {
        let store = mem_data_store();
        store.put(ANONYMOUS_USER, b"k", b"v").unwrap();
        assert_eq!(store.get(ANONYMOUS_USER, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_unopened_namespace_is_unknown_user() {
        let store = mem_data_store();
        match store.get("alice", b"k") {
            Err(StoreError::UnknownUser(name)) => assert_eq!(name, "alice"),
            other => panic!("expected UnknownUser, got {other:?}"),
        }

        store.open_database("alice").unwrap();
        assert_eq!(store.get("alice", b"k").unwrap(), None);
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let store = mem_data_store();
        store.open_database("alice").unwrap();
        store.open_database("bob").unwrap();
        store.put("alice", b"k", b"a").unwrap();
        store.put("bob", b"k", b"b").unwrap();
        assert_eq!(store.get("alice", b"k").unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get("bob", b"k").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let store = mem_data_store();
        store.delete(ANONYMOUS_USER, b"never-written").unwrap();
    }

    #[test]
    fn test_tagged_values() {
        let raw = tag_value(LogOp::Lock, b"session-1");
        let (op, payload) = parse_value(&raw);
        assert_eq!(op, Some(LogOp::Lock));
        assert_eq!(payload, b"session-1");

        let (op, payload) = parse_value(b"");
        assert_eq!(op, None);
        assert!(payload.is_empty());
    }
}
