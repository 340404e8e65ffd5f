//! Credential records and login-token bookkeeping
//!
//! Credentials mutate only through Register/Login/Logout log entries, so
//! every replica applies the same changes in the same order. The table is
//! cached in memory and mirrored to its own store namespace; the root
//! credential is additionally seeded from the meta store at startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::rpc::types::Status;
use crate::storage::{OrderedStore, StoreResult};

/// Reserved separator between a namespace and a key in watch bindings;
/// usernames must not contain it.
const NAME_SEPARATOR: &str = "::";

struct UserTables {
    /// username -> password digest
    credentials: HashMap<String, String>,
    /// login token -> username
    logged_in: HashMap<String, String>,
}

pub struct UserManager {
    store: Arc<dyn OrderedStore>,
    tables: Mutex<UserTables>,
}

impl UserManager {
    /// Load the credential table, seeding the root record if present.
    pub fn open(
        store: Arc<dyn OrderedStore>,
        root: Option<(String, String)>,
    ) -> StoreResult<UserManager> {
        let mut credentials = HashMap::new();
        for item in store.scan_from(&[])? {
            let (key, value) = item?;
            credentials.insert(
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        if let Some((username, password)) = root {
            let digest = Self::digest(&password);
            store.put(username.as_bytes(), digest.as_bytes())?;
            credentials.insert(username, digest);
        }
        info!(users = credentials.len(), "loaded credential table");
        Ok(UserManager {
            store,
            tables: Mutex::new(UserTables {
                credentials,
                logged_in: HashMap::new(),
            }),
        })
    }

    fn digest(input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex_encode(&hasher.finalize())
    }

    /// Deterministic login token for a username.
    pub fn calc_uuid(username: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"uuid/");
        hasher.update(username.as_bytes());
        hex_encode(&hasher.finalize()[..16])
    }

    pub fn is_valid_user(&self, username: &str) -> bool {
        self.tables.lock().credentials.contains_key(username)
    }

    pub fn is_logged_in(&self, uuid: &str) -> bool {
        self.tables.lock().logged_in.contains_key(uuid)
    }

    /// Namespace owning a token; the anonymous namespace for an empty or
    /// unknown token.
    pub fn username_for_uuid(&self, uuid: &str) -> String {
        if uuid.is_empty() {
            return String::new();
        }
        self.tables
            .lock()
            .logged_in
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a Login entry: authenticate and mark the token live.
    pub fn login(&self, username: &str, password: &str, uuid: &str) -> Status {
        let mut tables = self.tables.lock();
        match tables.credentials.get(username) {
            None => Status::UnknownUser,
            Some(stored) if *stored != Self::digest(password) => {
                warn!(username, "login with wrong password");
                Status::Error
            }
            Some(_) => {
                tables
                    .logged_in
                    .insert(uuid.to_string(), username.to_string());
                Status::Ok
            }
        }
    }

    /// Apply a Logout entry: drop the token.
    pub fn logout(&self, uuid: &str) -> Status {
        match self.tables.lock().logged_in.remove(uuid) {
            Some(_) => Status::Ok,
            None => Status::UnknownUser,
        }
    }

    /// Apply a Register entry: create the credential record.
    pub fn register(&self, username: &str, password: &str) -> Status {
        if username.is_empty() || username.contains(NAME_SEPARATOR) {
            return Status::Error;
        }
        let mut tables = self.tables.lock();
        if tables.credentials.contains_key(username) {
            warn!(username, "register of existing user");
            return Status::Error;
        }
        let digest = Self::digest(password);
        if let Err(e) = self.store.put(username.as_bytes(), digest.as_bytes()) {
            warn!(username, error = %e, "failed to persist credential");
            return Status::Error;
        }
        tables.credentials.insert(username.to_string(), digest);
        Status::Ok
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn manager() -> UserManager {
        UserManager::open(Arc::new(MemStore::new()), None).unwrap()
    }

    #[test]
    fn test_register_then_login() {
        let users = manager();
        assert_eq!(users.register("alice", "pw"), Status::Ok);
        assert!(users.is_valid_user("alice"));

        let uuid = UserManager::calc_uuid("alice");
        assert_eq!(users.login("alice", "pw", &uuid), Status::Ok);
        assert!(users.is_logged_in(&uuid));
        assert_eq!(users.username_for_uuid(&uuid), "alice");
    }

    #[test]
    fn test_login_failures() {
        let users = manager();
        users.register("alice", "pw");
        let uuid = UserManager::calc_uuid("alice");
        assert_eq!(users.login("alice", "wrong", &uuid), Status::Error);
        assert_eq!(users.login("bob", "pw", &uuid), Status::UnknownUser);
        assert!(!users.is_logged_in(&uuid));
    }

    #[test]
    fn test_register_duplicate_and_bad_names() {
        let users = manager();
        assert_eq!(users.register("alice", "pw"), Status::Ok);
        assert_eq!(users.register("alice", "pw2"), Status::Error);
        assert_eq!(users.register("", "pw"), Status::Error);
        assert_eq!(users.register("a::b", "pw"), Status::Error);
    }

    #[test]
    fn test_logout() {
        let users = manager();
        users.register("alice", "pw");
        let uuid = UserManager::calc_uuid("alice");
        users.login("alice", "pw", &uuid);
        assert_eq!(users.logout(&uuid), Status::Ok);
        assert_eq!(users.logout(&uuid), Status::UnknownUser);
        assert_eq!(users.username_for_uuid(&uuid), "");
    }

    #[test]
    fn test_uuid_is_deterministic() {
        assert_eq!(UserManager::calc_uuid("alice"), UserManager::calc_uuid("alice"));
        assert_ne!(UserManager::calc_uuid("alice"), UserManager::calc_uuid("bob"));
    }

    #[test]
    fn test_credentials_survive_reopen() {
        let store = Arc::new(MemStore::new());
        {
            let users = UserManager::open(store.clone(), None).unwrap();
            users.register("alice", "pw");
        }
        let users = UserManager::open(store, None).unwrap();
        assert!(users.is_valid_user("alice"));
        let uuid = UserManager::calc_uuid("alice");
        assert_eq!(users.login("alice", "pw", &uuid), Status::Ok);
    }

    #[test]
    fn test_root_seed() {
        let users = UserManager::open(
            Arc::new(MemStore::new()),
            Some(("root".to_string(), "secret".to_string())),
        )
        .unwrap();
        assert!(users.is_valid_user("root"));
        let uuid = UserManager::calc_uuid("root");
        assert_eq!(users.login("root", "secret", &uuid), Status::Ok);
    }
}
