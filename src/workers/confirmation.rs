//! Confirmation handler: tells the owner an image was received.

use super::{HandlerError, MessageHandler};
use crate::event::{Envelope, Message};
use crate::notify::{template, Addressing, Notifier};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Consumes the `mailer` queue.
///
/// The validation worker queues one image event per record it inserts, so
/// every message here names an image that is already persisted.
pub struct ConfirmationHandler {
    notifier: Arc<dyn Notifier>,
    addressing: Addressing,
}

impl ConfirmationHandler {
    pub fn new(notifier: Arc<dyn Notifier>, addressing: Addressing) -> Self {
        Self { notifier, addressing }
    }

    async fn confirm(&self, key: &str) {
        let notification = template::confirmation(&self.addressing, key);

        match self.notifier.send(&notification).await {
            Ok(()) => info!(
                id = %key,
                notifier = %self.notifier.name(),
                "Confirmation sent"
            ),
            Err(e) => error!(
                id = %key,
                notifier = %self.notifier.name(),
                error = %e,
                "Confirmation failed"
            ),
        }
    }
}

#[async_trait]
impl MessageHandler for ConfirmationHandler {
    fn name(&self) -> &str {
        "confirmation"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match Message::decode(envelope)? {
            Message::Image(event) => {
                self.confirm(&event.id).await;
                Ok(())
            }
            other => {
                debug!(message_id = %envelope.message_id, kind = %other.kind(), "Nothing to confirm");
                Ok(())
            }
        }
    }
}
