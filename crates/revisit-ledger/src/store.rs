use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use revisit_core::{VisitorId, VisitorRecord};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} out of range for storage")]
    OutOfRange(&'static str),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Physical backing for the ledger: point lookup, upsert and full scan.
///
/// `put` must be durable when it returns `Ok`. A failed `put` must leave the
/// stored record unchanged.
pub trait VisitorStore: Send + Sync {
    fn get(&self, id: VisitorId) -> Result<Option<VisitorRecord>, StoreError>;
    fn put(&self, record: &VisitorRecord) -> Result<(), StoreError>;
    /// All records in ascending id order.
    fn scan(&self) -> Result<Vec<VisitorRecord>, StoreError>;
}

impl<T: VisitorStore + ?Sized> VisitorStore for Arc<T> {
    fn get(&self, id: VisitorId) -> Result<Option<VisitorRecord>, StoreError> {
        (**self).get(id)
    }

    fn put(&self, record: &VisitorRecord) -> Result<(), StoreError> {
        (**self).put(record)
    }

    fn scan(&self) -> Result<Vec<VisitorRecord>, StoreError> {
        (**self).scan()
    }
}

/// Volatile store, used for ephemeral ledgers and tests.
///
/// Writes can be made to fail on demand to exercise rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<VisitorId, VisitorRecord>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (or succeed again).
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

impl VisitorStore for MemoryStore {
    fn get(&self, id: VisitorId) -> Result<Option<VisitorRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&id).cloned())
    }

    fn put(&self, record: &VisitorRecord) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!("visitor {}", record.id)));
        }
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn scan(&self) -> Result<Vec<VisitorRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use revisit_core::Embedding;

    fn record(id: u64) -> VisitorRecord {
        let now = Utc::now();
        VisitorRecord {
            id: VisitorId(id),
            display_name: "Unknown Visitor".into(),
            embeddings: vec![Embedding::new(vec![1.0, 0.0])],
            visit_count: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    #[test]
    fn test_memory_store_scan_is_ordered() {
        let store = MemoryStore::new();
        store.put(&record(7)).unwrap();
        store.put(&record(2)).unwrap();
        store.put(&record(5)).unwrap();
        let ids: Vec<u64> = store.scan().unwrap().iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![2, 5, 7]);
    }

    #[test]
    fn test_memory_store_rejected_write_keeps_old_value() {
        let store = MemoryStore::new();
        let mut r = record(1);
        store.put(&r).unwrap();

        store.set_reject_writes(true);
        r.visit_count = 9;
        assert!(matches!(store.put(&r), Err(StoreError::Rejected(_))));
        assert_eq!(store.get(VisitorId(1)).unwrap().unwrap().visit_count, 1);

        store.set_reject_writes(false);
        store.put(&r).unwrap();
        assert_eq!(store.get(VisitorId(1)).unwrap().unwrap().visit_count, 9);
    }
}
