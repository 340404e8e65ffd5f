//! In-memory ordered store for testing
//!
//! Fast, no side effects, no persistence across restarts.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use super::{OrderedStore, ScanIter, StoreResult, WriteBatch};
use super::traits::BatchOp;

/// `BTreeMap`-backed store. Ideal for unit tests where speed matters and
/// side effects are unwanted.
#[derive(Debug, Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

impl OrderedStore for MemStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut map = self.map.lock();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn scan_from(&self, start: &[u8]) -> StoreResult<ScanIter<'_>> {
        // Snapshot the tail of the map; scans here are test-sized.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .lock()
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(pairs.into_iter().map(Ok)))
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemStore::new();
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);

        // deleting a missing key succeeds
        store.delete(b"missing").unwrap();
    }

    #[test]
    fn test_batch_is_atomic_view() {
        let store = MemStore::new();
        store.put(b"a", b"old").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"new".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"c".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_scan_is_ordered() {
        let store = MemStore::new();
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();

        let keys: Vec<Vec<u8>> = store
            .scan_from(b"a")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let keys: Vec<Vec<u8>> = store
            .scan_from(b"b")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
