//! Ordered key/value store abstraction
//!
//! The binlog, the application data store and the user table all sit on the
//! same small interface: point reads and writes, an atomic write batch, and
//! a forward ordered scan. Implementations must be durable (`SledStore`) or
//! explicitly in-memory for tests (`MemStore`).

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O or backend error (e.g. disk full, permission denied)
    #[error("storage i/o: {0}")]
    Io(String),
    /// A stored record failed to decode
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// The namespace has never been opened on this node
    #[error("unknown namespace: {0:?}")]
    UnknownUser(String),
    /// A log slot could not be read back; the log is damaged
    #[error("unreadable log slot {0}")]
    BadSlot(i64),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A set of writes applied atomically
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

#[derive(Debug)]
pub(crate) enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Iterator over `(key, value)` pairs in ascending key order
pub type ScanIter<'a> = Box<dyn Iterator<Item = StoreResult<(Vec<u8>, Vec<u8>)>> + Send + 'a>;

/// Ordered key/value store
///
/// Implementations synchronize internally; handles are shared through `Arc`.
pub trait OrderedStore: Send + Sync {
    /// Point read. `Ok(None)` when the key is absent.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Point write.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Point delete. Deleting a missing key succeeds.
    fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Apply all writes in `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Forward scan over keys `>= start`, in key order.
    fn scan_from(&self, start: &[u8]) -> StoreResult<ScanIter<'_>>;

    /// Flush buffered writes to the OS.
    fn flush(&self) -> StoreResult<()>;
}
