//! Storage layer: ordered store backends, replicated log, node metadata,
//! application data store
//!
//! - `MemStore`: fast, in-memory backend for testing
//! - `SledStore`: durable backend used by the server binary
//! - `Binlog`: the replicated log
//! - `Meta`: term / vote / root-credential files
//! - `DataStore`: per-namespace application databases

pub mod binlog;
pub mod data;
pub mod memory;
pub mod meta;
pub mod sled_store;
pub mod traits;

pub use binlog::{Binlog, LogEntry, LogOp};
pub use data::DataStore;
pub use memory::MemStore;
pub use meta::Meta;
pub use sled_store::{SledStore, StoreTuning};
pub use traits::{OrderedStore, ScanIter, StoreError, StoreResult, WriteBatch};
