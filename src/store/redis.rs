//! Redis hash record store.
//!
//! Each record is a hash at `<table>:<id>`. The `id` field doubles as the
//! existence marker: `HSETNX` creates a record exactly once, and every
//! upsert rewrites `id` with the same value alongside the attribute.

use super::{ImageRecord, RecordStore, StoreError};
use async_trait::async_trait;
use deadpool_redis::redis::{cmd, ErrorKind, RedisError};
use deadpool_redis::{Connection, Pool};
use std::collections::BTreeMap;
use tracing::debug;

const ID_FIELD: &str = "id";

/// Connection trouble and server back-pressure are worth a retry; a reply the
/// server rejected (such as `WRONGTYPE`) will be rejected again.
fn classify(e: RedisError) -> StoreError {
    let transient = e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(
            e.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::ClusterDown | ErrorKind::MasterDown
        );

    if transient {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

/// Image records stored as Redis hashes.
#[derive(Clone)]
pub struct RedisRecordStore {
    table: String,
    pool: Pool,
}

impl RedisRecordStore {
    pub fn new(pool: Pool, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pool,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.table, id)
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn create_if_absent(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let created: bool = cmd("HSETNX")
            .arg(self.key(id))
            .arg(ID_FIELD)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        debug!(table = %self.table, id = %id, created = created, "Conditional create");
        Ok(created)
    }

    async fn upsert_field(&self, id: &str, name: &str, value: &str) -> Result<(), StoreError> {
        if name == ID_FIELD {
            return Err(StoreError::Backend("the id attribute is immutable".to_string()));
        }

        let mut conn = self.connection().await?;
        let _: u64 = cmd("HSET")
            .arg(self.key(id))
            .arg(ID_FIELD)
            .arg(id)
            .arg(name)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        debug!(table = %self.table, id = %id, attribute = %name, "Upserted field");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: BTreeMap<String, String> = cmd("HGETALL")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(record_from_fields(id, fields))
    }
}

fn record_from_fields(id: &str, mut fields: BTreeMap<String, String>) -> Option<ImageRecord> {
    fields.remove(ID_FIELD)?;
    Some(ImageRecord {
        id: id.to_string(),
        attributes: fields,
    })
}
