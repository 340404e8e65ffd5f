//! sled-backed ordered store
//!
//! Durable backend used by the server binary. One `SledStore` owns one sled
//! database directory (`#binlog`, `@db`, `<user>@db`, ...).

use std::path::Path;

use super::{OrderedStore, ScanIter, StoreError, StoreResult, WriteBatch};
use super::traits::BatchOp;

/// Tuning knobs carried from the command line into every opened database.
///
/// sled has no block-size knob; `block_size` is accepted for configuration
/// compatibility and folded into logging only.
#[derive(Debug, Clone, Copy)]
pub struct StoreTuning {
    pub compress: bool,
    pub block_size: usize,
    pub write_buffer_size: usize,
}

impl Default for StoreTuning {
    fn default() -> Self {
        StoreTuning {
            compress: false,
            block_size: 4 << 10,
            write_buffer_size: 4 << 20,
        }
    }
}

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the database at `dir`.
    pub fn open(dir: impl AsRef<Path>, tuning: StoreTuning) -> StoreResult<Self> {
        let config = sled::Config::new()
            .path(dir.as_ref())
            .use_compression(tuning.compress)
            .cache_capacity(tuning.write_buffer_size as u64);
        let db = config.open().map_err(sled_err)?;
        Ok(SledStore { db })
    }
}

fn sled_err(e: sled::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

impl OrderedStore for SledStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(sled_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.db.insert(key, value).map_err(sled_err)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.db.remove(key).map_err(sled_err)?;
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => sled_batch.insert(k, v),
                BatchOp::Delete(k) => sled_batch.remove(k),
            }
        }
        self.db.apply_batch(sled_batch).map_err(sled_err)?;
        Ok(())
    }

    fn scan_from(&self, start: &[u8]) -> StoreResult<ScanIter<'_>> {
        let iter = self.db.range(start.to_vec()..).map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(sled_err)
        });
        Ok(Box::new(iter))
    }

    fn flush(&self) -> StoreResult<()> {
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }
}
