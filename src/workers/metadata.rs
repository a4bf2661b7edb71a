//! Metadata update worker.
//!
//! Metadata messages are schema-checked where they enter the worker, then
//! handled as typed [`MetadataEvent`]s. Every update is a single-field
//! upsert, so applying the same event twice leaves the record as applying
//! it once does.

use super::validation::Validator;
use super::{HandlerError, MessageHandler};
use crate::event::{decode_object_key, CodecError, Envelope, Message, MessageKind, MetadataEvent};
use crate::schema::{SchemaFailure, SchemaRegistry, METADATA_SCHEMA};
use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a metadata update did not happen.
#[derive(Error, Debug)]
pub enum UpdateFailure {
    /// Payload does not match the metadata schema
    #[error("schema check failed: {0}")]
    Schema(#[from] SchemaFailure),

    /// Payload passed the schema but cannot name an image record
    #[error("malformed metadata event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UpdateFailure {
    /// Only transient store failures are worth another delivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateFailure::Store(e) if e.is_transient())
    }
}

/// Applies metadata events to the record store.
#[derive(Clone)]
pub struct MetadataUpdater {
    store: Arc<dyn RecordStore>,
}

impl MetadataUpdater {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Set exactly the named attribute, creating the record if needed.
    pub async fn apply(&self, event: &MetadataEvent) -> Result<(), UpdateFailure> {
        self.store
            .upsert_field(&event.id, event.attribute_name.as_str(), &event.attribute_value)
            .await?;

        info!(
            id = %event.id,
            attribute = %event.attribute_name,
            table = %self.store.table(),
            "Metadata applied"
        );
        Ok(())
    }
}

/// Consumes the `metadata-updates` queue.
pub struct MetadataHandler {
    updater: MetadataUpdater,
    schemas: Arc<SchemaRegistry>,
    validator: Validator,
}

impl MetadataHandler {
    pub fn new(updater: MetadataUpdater, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            updater,
            schemas,
            validator: Validator::new(),
        }
    }

    /// Boundary check on the raw body, then the typed event with a decoded
    /// image id. The schema runs first so that a body the typed decode
    /// rejects is still reported constraint by constraint.
    fn admit(
        &self,
        body: &str,
        decoded: Result<MetadataEvent, CodecError>,
    ) -> Result<MetadataEvent, UpdateFailure> {
        let payload: Value =
            serde_json::from_str(body).map_err(|e| UpdateFailure::Malformed(e.to_string()))?;
        self.schemas.validate(&payload, METADATA_SCHEMA)?;

        let mut event = decoded.map_err(|e| UpdateFailure::Malformed(e.to_string()))?;
        event.id = decode_object_key(&event.id).map_err(|e| UpdateFailure::Malformed(e.to_string()))?;
        if !self.validator.is_supported(&event.id) {
            return Err(UpdateFailure::Malformed(format!("'{}' is not an image key", event.id)));
        }
        Ok(event)
    }
}

#[async_trait]
impl MessageHandler for MetadataHandler {
    fn name(&self) -> &str {
        "metadata"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let decoded = match Message::decode(envelope) {
            Ok(Message::Metadata(event)) => Ok(event),
            Ok(other) => {
                debug!(message_id = %envelope.message_id, kind = %other.kind(), "Not a metadata message, skipping");
                return Ok(());
            }
            Err(e @ CodecError::Payload { kind: MessageKind::Metadata, .. }) => Err(e),
            Err(e) => return Err(e.into()),
        };

        let event = self.admit(&envelope.body, decoded).map_err(|failure| {
            warn!(
                message_id = %envelope.message_id,
                error = %failure,
                "Dropping malformed metadata message"
            );
            failure
        })?;

        self.updater.apply(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MetadataAttribute;
    use crate::store::InMemoryRecordStore;
    use crate::workers::Disposition;

    fn handler(store: Arc<InMemoryRecordStore>) -> MetadataHandler {
        MetadataHandler::new(MetadataUpdater::new(store), Arc::new(SchemaRegistry::with_builtin()))
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = Arc::new(InMemoryRecordStore::default());
        let updater = MetadataUpdater::new(store.clone());
        let event = MetadataEvent::new("a.png", MetadataAttribute::Caption, "sunset");

        updater.apply(&event).await.unwrap();
        let once = store.get("a.png").await.unwrap();
        updater.apply(&event).await.unwrap();
        let twice = store.get("a.png").await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.unwrap().attribute("Caption"), Some("sunset"));
    }

    #[tokio::test]
    async fn test_handler_decodes_id() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = handler(store.clone());
        let envelope = Envelope::metadata(&MetadataEvent::new(
            "beach+holiday.png",
            MetadataAttribute::Date,
            "2023-05-01",
        ));

        handler.handle(&envelope).await.unwrap();

        let record = store.get("beach holiday.png").await.unwrap().unwrap();
        assert_eq!(record.attribute("Date"), Some("2023-05-01"));
    }

    #[tokio::test]
    async fn test_schema_failure_is_dropped() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = handler(store.clone());
        let envelope = Envelope::new(r#"{"id":"a.png","attributeName":"Colour","attributeValue":"red"}"#)
            .with_attribute("metadata_type", "Colour");

        let err = handler.handle(&envelope).await.unwrap_err();

        assert!(matches!(err, HandlerError::Update(UpdateFailure::Schema(_))));
        assert_eq!(err.disposition(), Disposition::Drop);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_non_image_id_is_dropped() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = handler(store.clone());
        let envelope = Envelope::metadata(&MetadataEvent::new("notes.txt", MetadataAttribute::Caption, "x"));

        let err = handler.handle(&envelope).await.unwrap_err();

        assert_eq!(err.disposition(), Disposition::Drop);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_outage_is_retried() {
        let store = Arc::new(InMemoryRecordStore::default());
        store.set_available(false);
        let handler = handler(store.clone());
        let envelope = Envelope::metadata(&MetadataEvent::new("a.png", MetadataAttribute::Caption, "x"));

        let err = handler.handle(&envelope).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[tokio::test]
    async fn test_uploads_are_skipped() {
        use crate::event::UploadNotification;

        let store = Arc::new(InMemoryRecordStore::default());
        let handler = handler(store.clone());
        let envelope = Envelope::upload(&UploadNotification::object_created("a.png"));

        handler.handle(&envelope).await.unwrap();
        assert!(store.is_empty().await);
    }
}
