//! Volatile client session table
//!
//! Two views kept in sync: by session id for lookups, and by last report
//! time for the expiry sweep. Deletion always removes from both.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub last_report: Instant,
    /// Login token the session authenticated with, may be empty.
    pub uuid: String,
}

#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<String, Session>,
    by_time: BTreeMap<(Instant, String), ()>,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable::default()
    }

    /// Insert or refresh a session, replacing its last report time.
    pub fn upsert(&mut self, session: Session) {
        if let Some(old) = self.by_id.remove(&session.session_id) {
            self.by_time.remove(&(old.last_report, old.session_id));
        }
        self.by_time
            .insert((session.last_report, session.session_id.clone()), ());
        self.by_id.insert(session.session_id.clone(), session);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.by_id.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Remove and return every session whose last report is before
    /// `horizon`, oldest first.
    pub fn remove_expired(&mut self, horizon: Instant) -> Vec<Session> {
        let mut expired = Vec::new();
        loop {
            let oldest = match self.by_time.keys().next() {
                Some(key) => key.clone(),
                None => break,
            };
            let (report, session_id) = oldest;
            if report >= horizon {
                break;
            }
            self.by_time.remove(&(report, session_id.clone()));
            if let Some(session) = self.by_id.remove(&session_id) {
                expired.push(session);
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session(id: &str, at: Instant) -> Session {
        Session {
            session_id: id.to_string(),
            last_report: at,
            uuid: String::new(),
        }
    }

    #[test]
    fn test_upsert_and_contains() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.upsert(session("s1", now));
        assert!(table.contains("s1"));
        assert!(!table.contains("s2"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_refreshes_report_time() {
        let mut table = SessionTable::new();
        let old = Instant::now();
        let fresh = old + Duration::from_secs(10);
        table.upsert(session("s1", old));
        table.upsert(session("s1", fresh));
        assert_eq!(table.len(), 1);

        // the refreshed session survives a sweep past the old report time
        let expired = table.remove_expired(old + Duration::from_secs(1));
        assert!(expired.is_empty());
        assert!(table.contains("s1"));
    }

    #[test]
    fn test_remove_expired_takes_oldest_first() {
        let mut table = SessionTable::new();
        let base = Instant::now();
        table.upsert(session("old", base));
        table.upsert(session("mid", base + Duration::from_secs(5)));
        table.upsert(session("new", base + Duration::from_secs(10)));

        let expired = table.remove_expired(base + Duration::from_secs(7));
        let ids: Vec<&str> = expired.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid"]);
        assert!(table.contains("new"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_both_views_stay_in_sync() {
        let mut table = SessionTable::new();
        let now = Instant::now();
        table.upsert(session("s1", now));
        table.upsert(session("s2", now + Duration::from_secs(1)));
        let expired = table.remove_expired(now + Duration::from_secs(60));
        assert_eq!(expired.len(), 2);
        assert!(table.is_empty());
        // a fresh sweep finds nothing left behind in the time index
        assert!(table.remove_expired(now + Duration::from_secs(120)).is_empty());
    }
}
