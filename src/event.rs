//! Message envelope codec for Shutter.
//!
//! Every message travelling through the pipeline is an [`Envelope`]: an opaque
//! JSON `body` plus a flat map of string `attributes` used for routing. The
//! body is decoded into the typed [`Message`] union according to the
//! envelope's [`MessageKind`].
//!
//! # Wire format
//!
//! ```json
//! {
//!   "messageId": "1f0c…",
//!   "body": "{\"objectKey\":\"beach+holiday.png\",\"eventType\":\"OBJECT_CREATED\"}",
//!   "attributes": { "message_type": "upload" },
//!   "sentAt": "2023-05-01T10:00:00Z"
//! }
//! ```
//!
//! # Payloads
//!
//! ```text
//! Kind       | Body
//! -----------|--------------------------------------------------------
//! upload     | {"objectKey": "...", "eventType": "OBJECT_CREATED"}
//! metadata   | {"id": "...", "attributeName": "Caption", "attributeValue": "..."}
//! image      | {"id": "...", "value": <any>}
//! rejection  | {"id": "...", "reason": "..."}
//! ```

use chrono::Utc;
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Attribute naming the [`MessageKind`] of an envelope.
pub const MESSAGE_TYPE_ATTRIBUTE: &str = "message_type";

/// Attribute carrying the metadata attribute name, used for filtering.
pub const METADATA_TYPE_ATTRIBUTE: &str = "metadata_type";

/// Event type of an upload notification for a newly created object.
pub const OBJECT_CREATED: &str = "OBJECT_CREATED";

/// Errors raised while encoding or decoding messages.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    #[error("cannot determine message type from envelope")]
    Unclassified,

    #[error("object key is missing")]
    MissingKey,

    #[error("object key '{0}' does not decode to valid UTF-8")]
    InvalidKey(String),
}

/// Discriminates the payload carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Upload,
    Metadata,
    Image,
    Rejection,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Upload => "upload",
            MessageKind::Metadata => "metadata",
            MessageKind::Image => "image",
            MessageKind::Rejection => "rejection",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(MessageKind::Upload),
            "metadata" => Ok(MessageKind::Metadata),
            "image" => Ok(MessageKind::Image),
            "rejection" => Ok(MessageKind::Rejection),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

/// A message as it sits on a topic or queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per copy; fan-out assigns a fresh id to every delivered copy
    pub message_id: String,

    /// JSON-encoded payload
    pub body: String,

    /// Routing attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// RFC 3339 timestamp set when the envelope was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

impl Envelope {
    /// Create an envelope around a raw body.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body: body.into(),
            attributes: BTreeMap::new(),
            sent_at: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Get an attribute value
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// An independent copy with a fresh message id.
    pub fn copy(&self) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Envelope)
    }

    pub fn from_json(s: &str) -> Result<Self, CodecError> {
        serde_json::from_str(s).map_err(CodecError::Envelope)
    }

    /// Envelope for an upload notification.
    pub fn upload(notification: &UploadNotification) -> Self {
        let mut body = json!({
            "objectKey": notification.object_key,
            "eventType": notification.event_type,
        });
        if let Some(bucket) = &notification.bucket {
            body["bucket"] = json!(bucket);
        }
        if let Some(size) = notification.size {
            body["size"] = json!(size);
        }
        if let Some(content_type) = &notification.content_type {
            body["contentType"] = json!(content_type);
        }
        Self::new(body.to_string()).with_attribute(MESSAGE_TYPE_ATTRIBUTE, MessageKind::Upload.as_str())
    }

    /// Envelope for a metadata event, tagged with `metadata_type` for filtering.
    pub fn metadata(event: &MetadataEvent) -> Self {
        let body = json!({
            "id": event.id,
            "attributeName": event.attribute_name.as_str(),
            "attributeValue": event.attribute_value,
        });
        Self::new(body.to_string())
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, MessageKind::Metadata.as_str())
            .with_attribute(METADATA_TYPE_ATTRIBUTE, event.attribute_name.as_str())
    }

    /// Envelope for a structured image event.
    pub fn image(event: &ImageEvent) -> Self {
        let body = json!({ "id": event.id, "value": event.value });
        Self::new(body.to_string()).with_attribute(MESSAGE_TYPE_ATTRIBUTE, MessageKind::Image.as_str())
    }

    /// Envelope for a rejection event.
    pub fn rejection(event: &RejectionEvent) -> Self {
        let body = json!({ "id": event.id, "reason": event.reason });
        Self::new(body.to_string())
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, MessageKind::Rejection.as_str())
    }

    /// Determine the kind of payload carried.
    ///
    /// An explicit `message_type` attribute wins. Without one, a
    /// `metadata_type` attribute marks a metadata message and otherwise the
    /// body's fields decide.
    pub fn kind(&self) -> Result<MessageKind, CodecError> {
        if let Some(kind) = self.attribute(MESSAGE_TYPE_ATTRIBUTE) {
            return kind.parse();
        }

        if self.attributes.contains_key(METADATA_TYPE_ATTRIBUTE) {
            return Ok(MessageKind::Metadata);
        }

        let body: Value = serde_json::from_str(&self.body).map_err(CodecError::Envelope)?;
        if body.get("objectKey").is_some() || body.get("Records").is_some() {
            Ok(MessageKind::Upload)
        } else if body.get("attributeName").is_some() {
            Ok(MessageKind::Metadata)
        } else if body.get("reason").is_some() {
            Ok(MessageKind::Rejection)
        } else if body.get("id").is_some() {
            Ok(MessageKind::Image)
        } else {
            Err(CodecError::Unclassified)
        }
    }
}

fn default_event_type() -> String {
    OBJECT_CREATED.to_string()
}

/// Notification from the storage layer that an object changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadNotification {
    /// Raw (still URL-encoded) object key
    #[serde(default)]
    pub object_key: Option<String>,

    #[serde(default = "default_event_type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl UploadNotification {
    /// An `OBJECT_CREATED` notification for `key`.
    pub fn object_created(key: impl Into<String>) -> Self {
        Self {
            object_key: Some(key.into()),
            event_type: OBJECT_CREATED.to_string(),
            bucket: None,
            size: None,
            content_type: None,
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn is_object_created(&self) -> bool {
        self.event_type == OBJECT_CREATED
    }
}

/// Image attributes that metadata producers may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataAttribute {
    Caption,
    Date,
    Photographer,
}

impl MetadataAttribute {
    pub const ALL: [MetadataAttribute; 3] = [
        MetadataAttribute::Caption,
        MetadataAttribute::Date,
        MetadataAttribute::Photographer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataAttribute::Caption => "Caption",
            MetadataAttribute::Date => "Date",
            MetadataAttribute::Photographer => "Photographer",
        }
    }
}

impl fmt::Display for MetadataAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataAttribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataAttribute::ALL
            .into_iter()
            .find(|attr| attr.as_str() == s)
            .ok_or_else(|| format!("unknown metadata attribute '{}'", s))
    }
}

/// One field to set on an image record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEvent {
    pub id: String,
    pub attribute_name: MetadataAttribute,
    pub attribute_value: String,
}

impl MetadataEvent {
    pub fn new(id: impl Into<String>, attribute_name: MetadataAttribute, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attribute_name,
            attribute_value: value.into(),
        }
    }
}

/// A validated upload, keyed by its decoded object key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEvent {
    pub id: String,

    #[serde(default)]
    pub value: Value,
}

impl ImageEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: Value::Null,
        }
    }
}

/// A failed upload on its way to the rejection notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionEvent {
    pub id: String,
    pub reason: String,
}

/// Typed view of an envelope body.
///
/// An upload body may be a storage `Records[]` batch, so the upload arm holds
/// every notification it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Upload(Vec<UploadNotification>),
    Metadata(MetadataEvent),
    Image(ImageEvent),
    Rejection(RejectionEvent),
}

impl Message {
    /// Decode an envelope body according to its kind.
    pub fn decode(envelope: &Envelope) -> Result<Self, CodecError> {
        let kind = envelope.kind()?;
        let body = envelope.body.as_str();

        match kind {
            MessageKind::Upload => storage_notifications(body).map(Message::Upload),
            MessageKind::Metadata => decode_payload(kind, body).map(Message::Metadata),
            MessageKind::Image => decode_payload(kind, body).map(Message::Image),
            MessageKind::Rejection => decode_payload(kind, body).map(Message::Rejection),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Upload(_) => MessageKind::Upload,
            Message::Metadata(_) => MessageKind::Metadata,
            Message::Image(_) => MessageKind::Image,
            Message::Rejection(_) => MessageKind::Rejection,
        }
    }
}

/// Decode a JSON payload of the given kind.
pub fn decode_payload<T: DeserializeOwned>(kind: MessageKind, body: &str) -> Result<T, CodecError> {
    serde_json::from_str(body).map_err(|source| CodecError::Payload { kind, source })
}

/// Decode an object key as delivered by the storage layer.
///
/// `+` becomes a space first, then percent escapes are decoded. Malformed
/// escapes such as `%zz` are kept literally.
pub fn decode_object_key(raw: &str) -> Result<String, CodecError> {
    if raw.is_empty() {
        return Err(CodecError::MissingKey);
    }

    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| CodecError::InvalidKey(raw.to_string()))
}

#[derive(Deserialize)]
struct StorageEventNotification {
    #[serde(rename = "Records")]
    records: Vec<StorageEventRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageEventRecord {
    event_name: String,
    s3: StorageEntity,
}

#[derive(Deserialize)]
struct StorageEntity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Deserialize)]
struct ObjectEntity {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Expand a storage-layer body into upload notifications.
///
/// Accepts either a single `{"objectKey", "eventType"}` notification or a
/// `{"Records": [...]}` batch as emitted by S3-compatible stores, where any
/// `ObjectCreated:*` event name maps to [`OBJECT_CREATED`].
pub fn storage_notifications(body: &str) -> Result<Vec<UploadNotification>, CodecError> {
    let value: Value = serde_json::from_str(body).map_err(|source| CodecError::Payload {
        kind: MessageKind::Upload,
        source,
    })?;

    if value.get("Records").is_none() {
        let notification = serde_json::from_value(value).map_err(|source| CodecError::Payload {
            kind: MessageKind::Upload,
            source,
        })?;
        return Ok(vec![notification]);
    }

    let batch: StorageEventNotification =
        serde_json::from_value(value).map_err(|source| CodecError::Payload {
            kind: MessageKind::Upload,
            source,
        })?;

    Ok(batch
        .records
        .into_iter()
        .map(|record| UploadNotification {
            object_key: record.s3.object.key,
            event_type: storage_event_type(&record.event_name),
            bucket: Some(record.s3.bucket.name),
            size: record.s3.object.size,
            content_type: None,
        })
        .collect())
}

fn storage_event_type(event_name: &str) -> String {
    if event_name.starts_with("ObjectCreated:") {
        OBJECT_CREATED.to_string()
    } else {
        event_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object_key_plus_and_escapes() {
        assert_eq!(decode_object_key("beach+holiday.png").unwrap(), "beach holiday.png");
        assert_eq!(decode_object_key("beach%20holiday.png").unwrap(), "beach holiday.png");
        assert_eq!(decode_object_key("caf%C3%A9.jpeg").unwrap(), "café.jpeg");
        // An encoded plus stays a plus
        assert_eq!(decode_object_key("a%2Bb.png").unwrap(), "a+b.png");
    }

    #[test]
    fn test_decode_object_key_errors() {
        assert!(matches!(decode_object_key(""), Err(CodecError::MissingKey)));
        assert!(matches!(decode_object_key("bad%FF.png"), Err(CodecError::InvalidKey(_))));
    }

    #[test]
    fn test_upload_envelope_roundtrip_kind() {
        let envelope = Envelope::upload(&UploadNotification::object_created("beach+holiday.png"));
        assert_eq!(envelope.attribute(MESSAGE_TYPE_ATTRIBUTE), Some("upload"));

        match Message::decode(&envelope).unwrap() {
            Message::Upload(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].object_key.as_deref(), Some("beach+holiday.png"));
                assert!(batch[0].is_object_created());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_metadata_envelope_carries_filter_attribute() {
        let event = MetadataEvent::new("beach holiday.png", MetadataAttribute::Date, "2023-05-01");
        let envelope = Envelope::metadata(&event);

        assert_eq!(envelope.attribute(METADATA_TYPE_ATTRIBUTE), Some("Date"));
        assert_eq!(Message::decode(&envelope).unwrap(), Message::Metadata(event));
    }

    #[test]
    fn test_kind_inferred_without_message_type() {
        let upload = Envelope::new(r#"{"objectKey":"a.png","eventType":"OBJECT_CREATED"}"#);
        assert_eq!(upload.kind().unwrap(), MessageKind::Upload);

        let metadata = Envelope::new(r#"{"id":"a.png","attributeName":"Caption","attributeValue":"x"}"#);
        assert_eq!(metadata.kind().unwrap(), MessageKind::Metadata);

        let tagged = Envelope::new("{}").with_attribute(METADATA_TYPE_ATTRIBUTE, "Other");
        assert_eq!(tagged.kind().unwrap(), MessageKind::Metadata);

        let rejection = Envelope::new(r#"{"id":"notes.txt","reason":"unsupported extension"}"#);
        assert_eq!(rejection.kind().unwrap(), MessageKind::Rejection);

        let unknown = Envelope::new(r#"{"hello":"world"}"#);
        assert!(matches!(unknown.kind(), Err(CodecError::Unclassified)));
    }

    #[test]
    fn test_unknown_metadata_attribute_is_payload_error() {
        let envelope = Envelope::new(r#"{"id":"a.png","attributeName":"Other","attributeValue":"x"}"#)
            .with_attribute(MESSAGE_TYPE_ATTRIBUTE, "metadata");

        assert!(matches!(
            Message::decode(&envelope),
            Err(CodecError::Payload { kind: MessageKind::Metadata, .. })
        ));
    }

    #[test]
    fn test_records_body_decodes_to_upload_batch() {
        let envelope = Envelope::new(
            r#"{"Records":[
                {"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"photos"},"object":{"key":"a.png"}}},
                {"eventName":"ObjectRemoved:Delete","s3":{"bucket":{"name":"photos"},"object":{"key":"b.png"}}}
            ]}"#,
        );

        let Message::Upload(batch) = Message::decode(&envelope).unwrap() else {
            panic!("expected an upload batch");
        };
        assert_eq!(batch.len(), 2);
        assert!(batch[0].is_object_created());
        assert!(!batch[1].is_object_created());
    }

    #[test]
    fn test_envelope_json() {
        let envelope = Envelope::rejection(&RejectionEvent {
            id: "notes.txt".to_string(),
            reason: "unsupported extension".to_string(),
        });

        let json = envelope.to_json().unwrap();
        assert!(json.contains("messageId"));
        assert!(json.contains("sentAt"));

        let decoded = Envelope::from_json(&json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_copy_gets_fresh_id() {
        let envelope = Envelope::new("{}").with_attribute("a", "b");
        let copy = envelope.copy();
        assert_ne!(copy.message_id, envelope.message_id);
        assert_eq!(copy.body, envelope.body);
        assert_eq!(copy.attributes, envelope.attributes);
    }

    #[test]
    fn test_storage_records_expand() {
        let body = r#"{
            "Records": [
                {"eventName": "ObjectCreated:Put",
                 "s3": {"bucket": {"name": "images"}, "object": {"key": "beach+holiday.png", "size": 1024}}},
                {"eventName": "ObjectRemoved:Delete",
                 "s3": {"bucket": {"name": "images"}, "object": {"key": "old.png"}}}
            ]
        }"#;

        let notifications = storage_notifications(body).unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].event_type, OBJECT_CREATED);
        assert_eq!(notifications[0].bucket.as_deref(), Some("images"));
        assert_eq!(notifications[0].size, Some(1024));
        assert_eq!(notifications[1].event_type, "ObjectRemoved:Delete");
        assert!(!notifications[1].is_object_created());
    }

    #[test]
    fn test_storage_single_notification() {
        let notifications =
            storage_notifications(r#"{"objectKey":"a.jpeg","eventType":"OBJECT_CREATED"}"#).unwrap();
        assert_eq!(notifications, vec![UploadNotification::object_created("a.jpeg")]);
    }
}
