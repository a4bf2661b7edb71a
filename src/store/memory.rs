//! In-process record store.

use super::{ImageRecord, RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Records held in a map, with a switch to simulate an outage.
pub struct InMemoryRecordStore {
    table: String,
    records: RwLock<HashMap<String, ImageRecord>>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            records: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every operation fail with [`StoreError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Write operations attempted while available.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("table '{}' is offline", self.table)))
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new("Images")
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn create_if_absent(&self, id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.write().await;
        if records.contains_key(id) {
            debug!(table = %self.table, id = %id, "Record already exists");
            return Ok(false);
        }
        records.insert(id.to_string(), ImageRecord::new(id));
        Ok(true)
    }

    async fn upsert_field(&self, id: &str, name: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.write().await;
        records
            .entry(id.to_string())
            .or_insert_with(|| ImageRecord::new(id))
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        self.check_available()?;
        Ok(self.records.read().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_sets_id_once() {
        let store = InMemoryRecordStore::default();
        assert!(store.create_if_absent("a.png").await.unwrap());
        store.upsert_field("a.png", "Caption", "sunset").await.unwrap();

        // A second create leaves the existing record untouched
        assert!(!store.create_if_absent("a.png").await.unwrap());
        let record = store.get("a.png").await.unwrap().unwrap();
        assert_eq!(record.id, "a.png");
        assert_eq!(record.attribute("Caption"), Some("sunset"));
    }

    #[tokio::test]
    async fn test_upsert_creates_and_overwrites() {
        let store = InMemoryRecordStore::default();
        store.upsert_field("b.jpeg", "Date", "2023-05-01").await.unwrap();
        store.upsert_field("b.jpeg", "Date", "2023-05-02").await.unwrap();

        let record = store.get("b.jpeg").await.unwrap().unwrap();
        assert_eq!(record.attribute("Date"), Some("2023-05-02"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryRecordStore::default();
        store.set_available(false);

        let err = store.create_if_absent("a.png").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.write_count(), 0);

        store.set_available(true);
        assert!(store.create_if_absent("a.png").await.unwrap());
        assert_eq!(store.write_count(), 1);
    }
}
