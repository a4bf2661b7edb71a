//! Record Store: persistence for image records.
//!
//! The store owns [`ImageRecord`] state exclusively. Every operation touches
//! a single record, so the back end's atomic single-key writes are the only
//! concurrency control needed.
//!
//! - [`RecordStore::create_if_absent`] is the conditional write used when an
//!   upload is first accepted; `id` is set exactly once.
//! - [`RecordStore::upsert_field`] sets one attribute and creates the record
//!   if it does not exist yet, so metadata may arrive before the upload.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use memory::InMemoryRecordStore;
pub use redis::RedisRecordStore;

/// Errors raised by record stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable or throttled; the operation may succeed on retry
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Request rejected by the back end; retrying will not help
    #[error("record store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// An image record: its identity plus an open set of string attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }
}

/// Idempotent key-value persistence for image records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Name of the table records live in.
    fn table(&self) -> &str;

    /// Create the record `id` unless it exists. Returns true if created.
    async fn create_if_absent(&self, id: &str) -> Result<bool, StoreError>;

    /// Set attribute `name` of record `id`, creating the record if needed.
    async fn upsert_field(&self, id: &str, name: &str, value: &str) -> Result<(), StoreError>;

    /// Fetch a record.
    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError>;
}
