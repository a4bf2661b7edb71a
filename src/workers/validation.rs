//! Validation worker: turns raw upload notifications into image records.

use super::{HandlerError, MessageHandler};
use crate::event::{
    decode_object_key, CodecError, Envelope, ImageEvent, Message, MessageKind, UploadNotification,
};
use crate::queue::MessageQueue;
use crate::store::RecordStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Object key suffixes accepted as images.
pub const SUPPORTED_EXTENSIONS: [&str; 2] = [".png", ".jpeg"];

/// Attribute holding the structured `value` of an image event.
pub const VALUE_ATTRIBUTE: &str = "value";

/// An upload that can never become an image record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason} ({raw})")]
pub struct ValidationFailure {
    /// The offending event or key, as received
    pub raw: String,
    /// Human-readable reason
    pub reason: String,
}

impl ValidationFailure {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

/// Pure format and name checks on uploads.
#[derive(Debug, Clone)]
pub struct Validator {
    extensions: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::with_extensions(SUPPORTED_EXTENSIONS)
    }

    pub fn with_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    /// Case-sensitive suffix check on a decoded key.
    pub fn is_supported(&self, key: &str) -> bool {
        self.extensions.iter().any(|ext| key.ends_with(ext.as_str()))
    }

    /// Check an already decoded key.
    pub fn check_key(&self, key: &str) -> Result<(), ValidationFailure> {
        if self.is_supported(key) {
            Ok(())
        } else {
            Err(ValidationFailure::new(key, "unsupported extension"))
        }
    }

    /// Validate an upload notification and produce the structured event.
    pub fn validate(&self, notification: &UploadNotification) -> Result<ImageEvent, ValidationFailure> {
        let raw = notification.object_key.clone().unwrap_or_default();

        let key = match decode_object_key(&raw) {
            Ok(key) => key,
            Err(CodecError::MissingKey) => {
                return Err(ValidationFailure::new(raw, "missing object key"));
            }
            Err(_) => return Err(ValidationFailure::new(raw, "undecodable object key")),
        };

        if !self.is_supported(&key) {
            return Err(ValidationFailure::new(raw, "unsupported extension"));
        }

        Ok(ImageEvent::new(key))
    }
}

/// Consumes the `images` queue.
///
/// Upload notifications are validated and create their record exactly once.
/// Structured image events additionally write their `value`. Every record
/// this handler inserts is announced on the confirmation queue; records that
/// already existed are not. Other message kinds are acknowledged untouched.
pub struct ValidationHandler {
    validator: Validator,
    store: Arc<dyn RecordStore>,
    confirmations: Option<Arc<dyn MessageQueue>>,
}

impl ValidationHandler {
    pub fn new(validator: Validator, store: Arc<dyn RecordStore>) -> Self {
        Self {
            validator,
            store,
            confirmations: None,
        }
    }

    /// Announce newly inserted records on `queue`.
    pub fn with_confirmations(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.confirmations = Some(queue);
        self
    }

    async fn persist(&self, event: &ImageEvent) -> Result<(), HandlerError> {
        let created = self.store.create_if_absent(&event.id).await?;

        if created {
            info!(id = %event.id, table = %self.store.table(), "Image record created");
            self.announce(event).await;
        } else {
            debug!(id = %event.id, "Image record already exists");
        }

        if !event.value.is_null() {
            let value = match &event.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.store.upsert_field(&event.id, VALUE_ATTRIBUTE, &value).await?;
        }
        Ok(())
    }

    /// Best effort: the record is already in place when this runs.
    async fn announce(&self, event: &ImageEvent) {
        let Some(queue) = &self.confirmations else {
            return;
        };

        if let Err(e) = queue.send(Envelope::image(&ImageEvent::new(event.id.as_str()))).await {
            error!(
                id = %event.id,
                queue = %queue.name(),
                error = %e,
                "Failed to queue confirmation"
            );
        }
    }

    async fn handle_upload(&self, batch: &[UploadNotification]) -> Result<(), HandlerError> {
        let mut events = Vec::with_capacity(batch.len());
        for notification in batch.iter().filter(|n| n.is_object_created()) {
            events.push(self.validator.validate(notification)?);
        }

        if events.len() < batch.len() {
            debug!(skipped = batch.len() - events.len(), "Ignoring non object-created notifications");
        }

        for event in &events {
            self.persist(event).await?;
        }
        Ok(())
    }

    async fn handle_image(&self, event: &ImageEvent, raw: &str) -> Result<(), HandlerError> {
        if event.id.is_empty() {
            return Err(ValidationFailure::new(raw, "missing object key").into());
        }
        self.validator.check_key(&event.id)?;
        self.persist(event).await
    }
}

#[async_trait]
impl MessageHandler for ValidationHandler {
    fn name(&self) -> &str {
        "validation"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let result = match Message::decode(envelope) {
            Ok(Message::Upload(batch)) => self.handle_upload(&batch).await,
            Ok(Message::Image(event)) => self.handle_image(&event, &envelope.body).await,
            Ok(other) => {
                debug!(message_id = %envelope.message_id, kind = %other.kind(), "Not an upload, skipping");
                Ok(())
            }
            Err(CodecError::Payload { kind: MessageKind::Image, .. }) => {
                Err(ValidationFailure::new(envelope.body.as_str(), "unparseable image event").into())
            }
            Err(_) => Err(ValidationFailure::new(envelope.body.as_str(), "unparseable upload notification").into()),
        };

        if let Err(HandlerError::Validation(failure)) = &result {
            warn!(
                message_id = %envelope.message_id,
                raw = %failure.raw,
                reason = %failure.reason,
                "Upload rejected"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryRecordStore;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_extension_suffix_is_case_sensitive() {
        let v = Validator::new();
        assert!(v.is_supported("a.png"));
        assert!(v.is_supported("dir/b.jpeg"));
        assert!(!v.is_supported("a.PNG"));
        assert!(!v.is_supported("a.jpg"));
        assert!(!v.is_supported("a.png.txt"));
        assert!(!v.is_supported("png"));
    }

    #[test]
    fn test_validate_decodes_key() {
        let v = Validator::new();
        let event = v
            .validate(&UploadNotification::object_created("beach+holiday%2B1.png"))
            .unwrap();
        assert_eq!(event.id, "beach holiday+1.png");
    }

    #[test]
    fn test_validate_failures_keep_raw_key() {
        let v = Validator::new();

        let err = v.validate(&UploadNotification::object_created("notes.txt")).unwrap_err();
        assert_eq!(err.reason, "unsupported extension");
        assert_eq!(err.raw, "notes.txt");

        let mut missing = UploadNotification::object_created("");
        missing.object_key = None;
        assert_eq!(v.validate(&missing).unwrap_err().reason, "missing object key");

        let err = v.validate(&UploadNotification::object_created("bad%FF.png")).unwrap_err();
        assert_eq!(err.reason, "undecodable object key");
    }

    #[tokio::test]
    async fn test_invalid_upload_never_touches_store() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = ValidationHandler::new(Validator::new(), store.clone());

        let envelope = Envelope::upload(&UploadNotification::object_created("notes.txt"));
        let err = handler.handle(&envelope).await.unwrap_err();

        assert!(matches!(err, HandlerError::Validation(_)));
        assert_eq!(store.write_count(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_valid_upload_creates_record_once() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = ValidationHandler::new(Validator::new(), store.clone());
        let envelope = Envelope::upload(&UploadNotification::object_created("beach+holiday.png"));

        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let record = store.get("beach holiday.png").await.unwrap().unwrap();
        assert_eq!(record.id, "beach holiday.png");
        assert!(record.attributes.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_other_event_types_are_ignored() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = ValidationHandler::new(Validator::new(), store.clone());

        let mut removed = UploadNotification::object_created("a.png");
        removed.event_type = "OBJECT_REMOVED".to_string();
        handler.handle(&Envelope::upload(&removed)).await.unwrap();

        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_image_event_writes_value() {
        let store = Arc::new(InMemoryRecordStore::default());
        let handler = ValidationHandler::new(Validator::new(), store.clone());

        let mut event = ImageEvent::new("cat.jpeg");
        event.value = json!("bucket-a");
        handler.handle(&Envelope::image(&event)).await.unwrap();

        let record = store.get("cat.jpeg").await.unwrap().unwrap();
        assert_eq!(record.attribute(VALUE_ATTRIBUTE), Some("bucket-a"));
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let store = Arc::new(InMemoryRecordStore::default());
        store.set_available(false);
        let handler = ValidationHandler::new(Validator::new(), store.clone());

        let envelope = Envelope::upload(&UploadNotification::object_created("a.png"));
        let err = handler.handle(&envelope).await.unwrap_err();

        assert_eq!(err.disposition(), super::super::Disposition::Retry);
    }

    #[tokio::test]
    async fn test_only_inserted_records_are_announced() {
        let store = Arc::new(InMemoryRecordStore::default());
        let mailer = Arc::new(InMemoryQueue::new("mailer"));
        let handler = ValidationHandler::new(Validator::new(), store.clone()).with_confirmations(mailer.clone());
        let envelope = Envelope::upload(&UploadNotification::object_created("beach+holiday.png"));

        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let queued = mailer.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].envelope.kind().unwrap(), MessageKind::Image);
        assert!(queued[0].envelope.body.contains("beach holiday.png"));
    }

    #[tokio::test]
    async fn test_nothing_announced_when_store_is_down() {
        let store = Arc::new(InMemoryRecordStore::default());
        store.set_available(false);
        let mailer = Arc::new(InMemoryQueue::new("mailer"));
        let handler = ValidationHandler::new(Validator::new(), store.clone()).with_confirmations(mailer.clone());

        let envelope = Envelope::upload(&UploadNotification::object_created("a.png"));
        assert!(handler.handle(&envelope).await.is_err());

        assert_eq!(mailer.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_garbage_body_is_a_validation_failure() {
        let handler = ValidationHandler::new(Validator::new(), Arc::new(InMemoryRecordStore::default()));
        let err = handler.handle(&Envelope::new("not json")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }
}
