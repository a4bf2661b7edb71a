//! Rejection handler: tells the owner an upload was turned away.
//!
//! Consumes the dead-letter queue of `images`. Notification is best effort;
//! a failed send is logged and the message is still acknowledged.

use super::{HandlerError, MessageHandler};
use crate::dlq::DeadLetterInfo;
use crate::event::{decode_object_key, Envelope, Message, RejectionEvent};
use crate::notify::{template, Addressing, Notifier};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Reason used when a dead-lettered message carries none.
const UNKNOWN_REASON: &str = "processing failed";

impl RejectionEvent {
    /// Rebuild the rejection from a dead-lettered envelope.
    ///
    /// An explicit rejection body is used as is. Otherwise the id is the
    /// decoded object key of the failed upload (the raw key when it does not
    /// decode) and the reason comes from the dead-letter stamp.
    pub fn from_dead_letter(envelope: &Envelope) -> Self {
        let id = match Message::decode(envelope) {
            Ok(Message::Rejection(event)) => return event,
            Ok(Message::Image(event)) => event.id,
            Ok(Message::Upload(batch)) => batch
                .into_iter()
                .find_map(|n| n.object_key)
                .map(|raw| decode_object_key(&raw).unwrap_or(raw))
                .unwrap_or_else(|| envelope.body.clone()),
            Ok(Message::Metadata(event)) => event.id,
            Err(_) => envelope.body.clone(),
        };

        let reason = DeadLetterInfo::from_envelope(envelope)
            .reason
            .unwrap_or_else(|| UNKNOWN_REASON.to_string());

        Self { id, reason }
    }
}

/// Consumes the `bad-images` queue.
pub struct RejectionHandler {
    notifier: Arc<dyn Notifier>,
    addressing: Addressing,
}

impl RejectionHandler {
    pub fn new(notifier: Arc<dyn Notifier>, addressing: Addressing) -> Self {
        Self { notifier, addressing }
    }
}

#[async_trait]
impl MessageHandler for RejectionHandler {
    fn name(&self) -> &str {
        "rejection"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let event = RejectionEvent::from_dead_letter(envelope);
        let notification = template::rejection(&self.addressing, &event.id, &event.reason);

        match self.notifier.send(&notification).await {
            Ok(()) => info!(
                id = %event.id,
                reason = %event.reason,
                notifier = %self.notifier.name(),
                "Rejection notification sent"
            ),
            Err(e) => error!(
                id = %event.id,
                notifier = %self.notifier.name(),
                error = %e,
                "Rejection notification failed"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::stamp;
    use crate::event::UploadNotification;
    use crate::notify::MemoryNotifier;

    fn addressing() -> Addressing {
        Addressing::new("owner@example.com", "album@example.com", "photos")
    }

    #[test]
    fn test_event_from_stamped_upload() {
        let upload = Envelope::upload(&UploadNotification::object_created("my+notes.txt"));
        let dead = stamp(&upload, "images", 1, "unsupported extension");

        let event = RejectionEvent::from_dead_letter(&dead);
        assert_eq!(event.id, "my notes.txt");
        assert_eq!(event.reason, "unsupported extension");
    }

    #[test]
    fn test_event_from_rejection_body() {
        let envelope = Envelope::rejection(&RejectionEvent {
            id: "x.gif".into(),
            reason: "too small".into(),
        });
        let event = RejectionEvent::from_dead_letter(&envelope);
        assert_eq!(event.id, "x.gif");
        assert_eq!(event.reason, "too small");
    }

    #[test]
    fn test_event_from_stamped_image() {
        let image = Envelope::image(&crate::event::ImageEvent::new("cat.jpeg"));
        let dead = stamp(&image, "images", 1, "record store unavailable");

        let event = RejectionEvent::from_dead_letter(&dead);
        assert_eq!(event.id, "cat.jpeg");
        assert_eq!(event.reason, "record store unavailable");
    }

    #[test]
    fn test_unstamped_upload_gets_default_reason() {
        let upload = Envelope::upload(&UploadNotification::object_created("a.bmp"));
        let event = RejectionEvent::from_dead_letter(&upload);
        assert_eq!(event.reason, UNKNOWN_REASON);
    }

    #[tokio::test]
    async fn test_sends_one_notification() {
        let notifier = Arc::new(MemoryNotifier::new());
        let handler = RejectionHandler::new(notifier.clone(), addressing());
        let dead = stamp(
            &Envelope::upload(&UploadNotification::object_created("notes.txt")),
            "images",
            1,
            "unsupported extension",
        );

        handler.handle(&dead).await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, template::REJECTION_SUBJECT);
        assert!(sent[0].body_html.contains("notes.txt"));
    }

    #[tokio::test]
    async fn test_notifier_failure_still_acks() {
        let notifier = Arc::new(MemoryNotifier::new().failing_on("notes.txt"));
        let handler = RejectionHandler::new(notifier.clone(), addressing());
        let dead = stamp(
            &Envelope::upload(&UploadNotification::object_created("notes.txt")),
            "images",
            1,
            "unsupported extension",
        );

        assert!(handler.handle(&dead).await.is_ok());
        assert_eq!(notifier.attempts(), 1);
        assert!(notifier.sent().is_empty());
    }
}
