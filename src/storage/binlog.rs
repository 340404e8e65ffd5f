//! Replicated binary log over an ordered store
//!
//! Entries live at 0-based indices; the slot key is the index as 8 bytes
//! big-endian so an ordered scan visits slots in log order. A reserved
//! non-numeric key holds the current length (`last index = length - 1`).
//!
//! All framed integers and stored counters are little-endian; replicas on
//! different architectures must agree on the byte order, so it is fixed
//! here rather than inherited from the host.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{OrderedStore, StoreError, StoreResult, WriteBatch};

/// Reserved key holding the log length.
pub const LENGTH_KEY: &[u8] = b"#BINLOG_LEN#";

/// How many slot deletions are grouped into one batch during prefix GC.
const GC_BATCH: usize = 1024;

/// Operation carried by a log entry.
///
/// The discriminant doubles as the one-byte tag in front of values stored
/// in the application data store (only `Put` and `Lock` ever reach it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogOp {
    Nop = 0,
    Put = 1,
    Del = 2,
    Lock = 3,
    Unlock = 4,
    Login = 5,
    Logout = 6,
    Register = 7,
}

impl LogOp {
    pub fn from_u8(b: u8) -> Option<LogOp> {
        match b {
            0 => Some(LogOp::Nop),
            1 => Some(LogOp::Put),
            2 => Some(LogOp::Del),
            3 => Some(LogOp::Lock),
            4 => Some(LogOp::Unlock),
            5 => Some(LogOp::Login),
            6 => Some(LogOp::Logout),
            7 => Some(LogOp::Register),
            _ => None,
        }
    }
}

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op: LogOp,
    /// Owning namespace (login token / username), empty for the anonymous one
    pub user: String,
    pub key: String,
    pub value: String,
    /// Term when the entry was accepted by the leader
    pub term: i64,
}

impl LogEntry {
    /// Frame: `op(1) | user_len(4) | user | key_len(4) | key |
    /// value_len(4) | value | term(8)`, integers little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 4 + self.user.len() + 4 + self.key.len() + 4 + self.value.len() + 8,
        );
        buf.push(self.op as u8);
        buf.extend_from_slice(&(self.user.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.user.as_bytes());
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.value.as_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> StoreResult<LogEntry> {
        let mut cursor = Cursor { buf, pos: 0 };
        let op_byte = cursor.take(1)?[0];
        let op = LogOp::from_u8(op_byte)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log op {op_byte}")))?;
        let user = cursor.take_string()?;
        let key = cursor.take_string()?;
        let value = cursor.take_string()?;
        let term_bytes: [u8; 8] = cursor.take(8)?.try_into().expect("sized slice");
        if cursor.pos != buf.len() {
            return Err(StoreError::Corrupt(format!(
                "trailing {} bytes after log entry",
                buf.len() - cursor.pos
            )));
        }
        Ok(LogEntry {
            op,
            user,
            key,
            value,
            term: i64::from_le_bytes(term_bytes),
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(StoreError::Corrupt("truncated log entry".to_string()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_string(&mut self) -> StoreResult<String> {
        let len_bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        let len = u32::from_le_bytes(len_bytes) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::Corrupt("log entry field is not utf-8".to_string()))
    }
}

/// Encode an index/counter value for storage (little-endian).
pub fn encode_i64(v: i64) -> [u8; 8] {
    v.to_le_bytes()
}

/// Decode a stored index/counter value.
pub fn decode_i64(buf: &[u8]) -> StoreResult<i64> {
    let bytes: [u8; 8] = buf
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("counter is {} bytes, want 8", buf.len())))?;
    Ok(i64::from_le_bytes(bytes))
}

fn slot_key(index: i64) -> [u8; 8] {
    (index as u64).to_be_bytes()
}

struct BinlogState {
    length: i64,
    last_term: i64,
}

/// Append-only replicated log backed by an [`OrderedStore`].
///
/// One writer at a time: `append`, `append_batch` and `truncate` serialize
/// on the internal mutex. Readers go straight to the store but never
/// observe slots at or beyond the current length.
pub struct Binlog {
    store: Box<dyn OrderedStore>,
    state: Mutex<BinlogState>,
}

impl Binlog {
    /// Open the log, recovering length and last term from the store.
    pub fn open(store: Box<dyn OrderedStore>) -> StoreResult<Binlog> {
        let mut length = 0;
        let mut last_term = -1;
        if let Some(raw) = store.get(LENGTH_KEY)? {
            length = decode_i64(&raw)?;
            if length > 0 {
                let raw = store
                    .get(&slot_key(length - 1))?
                    .ok_or(StoreError::BadSlot(length - 1))?;
                last_term = LogEntry::decode(&raw)?.term;
            }
        }
        info!(length, last_term, "opened binlog");
        Ok(Binlog {
            store,
            state: Mutex::new(BinlogState { length, last_term }),
        })
    }

    pub fn length(&self) -> i64 {
        self.state.lock().length
    }

    /// Index of the last entry, `-1` when the log is empty.
    pub fn last_index(&self) -> i64 {
        self.state.lock().length - 1
    }

    pub fn last_index_and_term(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.length - 1, state.last_term)
    }

    /// Append one entry at the current length. Returns the index written.
    pub fn append(&self, entry: &LogEntry) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let index = state.length;
        let mut batch = WriteBatch::new();
        batch.put(slot_key(index).to_vec(), entry.encode());
        batch.put(LENGTH_KEY.to_vec(), encode_i64(index + 1).to_vec());
        self.store.write_batch(batch)?;
        state.length = index + 1;
        state.last_term = entry.term;
        Ok(index)
    }

    /// Append several entries and the new length in one atomic batch.
    pub fn append_batch(&self, entries: &[LogEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();
        for (i, entry) in entries.iter().enumerate() {
            batch.put(slot_key(state.length + i as i64).to_vec(), entry.encode());
        }
        let new_length = state.length + entries.len() as i64;
        batch.put(LENGTH_KEY.to_vec(), encode_i64(new_length).to_vec());
        self.store.write_batch(batch)?;
        state.length = new_length;
        state.last_term = entries[entries.len() - 1].term;
        Ok(())
    }

    /// Read the entry at `index`. `Ok(None)` outside `[0, length)`.
    pub fn read_slot(&self, index: i64) -> StoreResult<Option<LogEntry>> {
        if index < 0 || index >= self.length() {
            return Ok(None);
        }
        match self.store.get(&slot_key(index))? {
            Some(raw) => Ok(Some(
                LogEntry::decode(&raw).map_err(|_| StoreError::BadSlot(index))?,
            )),
            None => Ok(None),
        }
    }

    /// Drop every entry after `last_kept` (pass `-1` to clear the log).
    /// Physical deletion of the tail slots is lazy; the shortened length
    /// hides them from readers and appends overwrite them.
    pub fn truncate(&self, last_kept: i64) -> StoreResult<()> {
        let last_kept = last_kept.max(-1);
        let mut state = self.state.lock();
        state.length = last_kept + 1;
        self.store
            .put(LENGTH_KEY, &encode_i64(state.length))?;
        state.last_term = if state.length > 0 {
            let raw = self
                .store
                .get(&slot_key(state.length - 1))?
                .ok_or(StoreError::BadSlot(state.length - 1))?;
            LogEntry::decode(&raw)?.term
        } else {
            -1
        };
        Ok(())
    }

    /// Physically delete every slot with index `<= upto`. Reads above
    /// `upto` are unaffected.
    pub fn gc_prefix(&self, upto: i64) -> StoreResult<()> {
        if upto < 0 {
            return Ok(());
        }
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        {
            let iter = self.store.scan_from(&[])?;
            for item in iter {
                let (key, _) = item?;
                // Only 8-byte keys are slots; skip the length tag.
                if key.len() != 8 {
                    continue;
                }
                let index = u64::from_be_bytes(key[..8].try_into().expect("sized slice")) as i64;
                if index > upto {
                    break;
                }
                doomed.push(key);
            }
        }
        info!(upto, slots = doomed.len(), "gc binlog prefix");
        for chunk in doomed.chunks(GC_BATCH) {
            let mut batch = WriteBatch::new();
            for key in chunk {
                batch.delete(key.clone());
            }
            self.store.write_batch(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    fn entry(op: LogOp, key: &str, value: &str, term: i64) -> LogEntry {
        LogEntry {
            op,
            user: String::new(),
            key: key.to_string(),
            value: value.to_string(),
            term,
        }
    }

    fn open_mem() -> Binlog {
        Binlog::open(Box::new(MemStore::new())).unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let e = LogEntry {
            op: LogOp::Lock,
            user: "alice".to_string(),
            key: "/svc/leader".to_string(),
            value: "session-9".to_string(),
            term: 42,
        };
        assert_eq!(LogEntry::decode(&e.encode()).unwrap(), e);
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let mut raw = entry(LogOp::Put, "k", "v", 1).encode();
        raw.truncate(raw.len() - 3);
        assert!(LogEntry::decode(&raw).is_err());
    }

    #[test]
    fn test_append_advances_length_and_term() {
        let log = open_mem();
        assert_eq!(log.last_index_and_term(), (-1, -1));

        assert_eq!(log.append(&entry(LogOp::Put, "a", "1", 3)).unwrap(), 0);
        assert_eq!(log.append(&entry(LogOp::Put, "b", "2", 4)).unwrap(), 1);
        assert_eq!(log.last_index_and_term(), (1, 4));

        let read = log.read_slot(1).unwrap().unwrap();
        assert_eq!(read.key, "b");
        assert!(log.read_slot(2).unwrap().is_none());
        assert!(log.read_slot(-1).unwrap().is_none());
    }

    #[test]
    fn test_append_batch_is_one_write() {
        let log = open_mem();
        log.append_batch(&[
            entry(LogOp::Put, "a", "1", 1),
            entry(LogOp::Del, "b", "", 1),
            entry(LogOp::Nop, "Ping", "", 2),
        ])
        .unwrap();
        assert_eq!(log.length(), 3);
        assert_eq!(log.last_index_and_term(), (2, 2));
        assert_eq!(log.read_slot(1).unwrap().unwrap().op, LogOp::Del);
    }

    #[test]
    fn test_truncate_hides_tail_and_resumes_append() {
        let log = open_mem();
        for i in 0..5 {
            log.append(&entry(LogOp::Put, &format!("k{i}"), "v", i)).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.last_index_and_term(), (2, 2));
        assert!(log.read_slot(3).unwrap().is_none());

        // append resumes at the new length with a fresh term
        assert_eq!(log.append(&entry(LogOp::Put, "x", "y", 7)).unwrap(), 3);
        assert_eq!(log.last_index_and_term(), (3, 7));
        assert_eq!(log.read_slot(3).unwrap().unwrap().key, "x");
    }

    #[test]
    fn test_truncate_to_empty() {
        let log = open_mem();
        log.append(&entry(LogOp::Put, "a", "1", 1)).unwrap();
        log.truncate(-1).unwrap();
        assert_eq!(log.last_index_and_term(), (-1, -1));
        assert_eq!(log.append(&entry(LogOp::Put, "b", "2", 2)).unwrap(), 0);
    }

    #[test]
    fn test_reopen_recovers_state() {
        let store = std::sync::Arc::new(MemStore::new());
        {
            let log = Binlog::open(Box::new(SharedStore(store.clone()))).unwrap();
            log.append(&entry(LogOp::Put, "a", "1", 5)).unwrap();
            log.append(&entry(LogOp::Put, "b", "2", 6)).unwrap();
        }
        let log = Binlog::open(Box::new(SharedStore(store))).unwrap();
        assert_eq!(log.last_index_and_term(), (1, 6));
        assert_eq!(log.read_slot(0).unwrap().unwrap().key, "a");
    }

    #[test]
    fn test_gc_prefix_keeps_upper_slots() {
        let log = open_mem();
        for i in 0..10 {
            log.append(&entry(LogOp::Put, &format!("k{i}"), "v", 1)).unwrap();
        }
        log.gc_prefix(6).unwrap();
        // GC'd slots read as absent, later slots survive
        assert!(log.read_slot(6).unwrap().is_none());
        assert_eq!(log.read_slot(7).unwrap().unwrap().key, "k7");
        assert_eq!(log.length(), 10);
    }

    /// Store wrapper that lets tests share one `MemStore` across reopens.
    struct SharedStore(std::sync::Arc<MemStore>);

    impl OrderedStore for SharedStore {
        fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.0.get(key)
        }
        fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
            self.0.put(key, value)
        }
        fn delete(&self, key: &[u8]) -> StoreResult<()> {
            self.0.delete(key)
        }
        fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
            self.0.write_batch(batch)
        }
        fn scan_from(&self, start: &[u8]) -> StoreResult<crate::storage::ScanIter<'_>> {
            self.0.scan_from(start)
        }
        fn flush(&self) -> StoreResult<()> {
            self.0.flush()
        }
    }
}
