//! In-memory transactional cache table
//!
//! Implements the [`CacheTable`] port with the transaction semantics of
//! the on-disk table it stands in for: mutations between
//! `transaction_start` and `transaction_commit` are atomic, and
//! `transaction_cancel` discards them.

use crate::domain::ports::CacheTable;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct Inner {
    map: BTreeMap<Vec<u8>, Bytes>,
    /// Pending state while a transaction is open
    txn: Option<BTreeMap<Vec<u8>, Bytes>>,
    created: bool,
}

impl Inner {
    fn live(&self) -> &BTreeMap<Vec<u8>, Bytes> {
        self.txn.as_ref().unwrap_or(&self.map)
    }

    fn live_mut(&mut self) -> &mut BTreeMap<Vec<u8>, Bytes> {
        self.txn.as_mut().unwrap_or(&mut self.map)
    }
}

/// In-memory [`CacheTable`] implementation
#[derive(Default)]
pub struct MemoryCacheTable {
    inner: Mutex<Inner>,
}

impl MemoryCacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, for test assertions
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheTable for MemoryCacheTable {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.lock().live().get(key).cloned()
    }

    fn store(&self, key: &[u8], value: Bytes) {
        let mut inner = self.inner.lock();
        inner.created = true;
        inner.live_mut().insert(key.to_vec(), value);
    }

    fn delete(&self, key: &[u8]) {
        self.inner.lock().live_mut().remove(key);
    }

    fn keys(&self) -> Vec<Bytes> {
        self.inner
            .lock()
            .live()
            .keys()
            .map(|k| Bytes::copy_from_slice(k))
            .collect()
    }

    fn transaction_start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.txn.is_some() {
            return Err(Error::CacheTable(
                "transaction already in progress".to_string(),
            ));
        }
        let snapshot = inner.map.clone();
        inner.txn = Some(snapshot);
        Ok(())
    }

    fn transaction_commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.txn.take() {
            Some(pending) => {
                inner.map = pending;
                Ok(())
            }
            None => Err(Error::CacheTable("no transaction in progress".to_string())),
        }
    }

    fn transaction_cancel(&self) {
        self.inner.lock().txn = None;
    }

    fn exists(&self) -> bool {
        self.inner.lock().created
    }

    fn wipe(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.txn = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let table = MemoryCacheTable::new();
        assert!(!table.exists());

        table.store(b"GROUP HWM\x00", Bytes::from_static(&[1, 0, 0, 0]));
        assert!(table.exists());
        assert_eq!(
            table.get(b"GROUP HWM\x00"),
            Some(Bytes::from_static(&[1, 0, 0, 0]))
        );
        assert_eq!(table.get(b"missing"), None);
    }

    #[test]
    fn test_transaction_commit_applies() {
        let table = MemoryCacheTable::new();
        table.store(b"a", Bytes::from_static(b"1"));

        table.transaction_start().unwrap();
        table.store(b"b", Bytes::from_static(b"2"));
        table.delete(b"a");
        table.transaction_commit().unwrap();

        assert_eq!(table.get(b"a"), None);
        assert_eq!(table.get(b"b"), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn test_transaction_cancel_discards() {
        let table = MemoryCacheTable::new();
        table.store(b"a", Bytes::from_static(b"1"));

        table.transaction_start().unwrap();
        table.delete(b"a");
        table.store(b"b", Bytes::from_static(b"2"));
        table.transaction_cancel();

        assert_eq!(table.get(b"a"), Some(Bytes::from_static(b"1")));
        assert_eq!(table.get(b"b"), None);
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let table = MemoryCacheTable::new();
        table.transaction_start().unwrap();
        assert!(table.transaction_start().is_err());
        table.transaction_cancel();
        assert!(table.transaction_start().is_ok());
    }

    #[test]
    fn test_wipe() {
        let table = MemoryCacheTable::new();
        table.store(b"a", Bytes::from_static(b"1"));
        table.wipe().unwrap();
        assert!(table.is_empty());
        // A wiped table still counts as created
        assert!(table.exists());
    }
}
