//! Message handlers run by the consumers.
//!
//! Every queue in the pipeline has one [`MessageHandler`]. Handlers return
//! typed errors; [`HandlerError::disposition`] is the single place that
//! decides what happens to a failed message:
//!
//! ```text
//! HandlerError              Disposition
//! ------------------------  -----------------------------------------
//! Validation                DeadLetter  (non-retryable, rejected)
//! Update: schema/malformed  Drop        (non-retryable, logged)
//! Update/Store: transient   Retry       (redelivered up to the budget)
//! Codec                     Drop
//! Delivery                  Retry
//! ```

pub mod confirmation;
pub mod metadata;
pub mod rejection;
pub mod validation;

use crate::event::{CodecError, Envelope};
use crate::router::Router;
use crate::store::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use confirmation::ConfirmationHandler;
pub use metadata::{MetadataHandler, MetadataUpdater, UpdateFailure};
pub use rejection::RejectionHandler;
pub use validation::{ValidationFailure, ValidationHandler, Validator};

/// What the consumer does with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Make the message visible again; the queue's redrive policy applies
    Retry,
    /// Send straight to the dead-letter queue
    DeadLetter,
    /// Acknowledge and forget
    Drop,
}

/// Errors returned by message handlers.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("metadata update failed: {0}")]
    Update(#[from] UpdateFailure),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("undecodable message: {0}")]
    Codec(#[from] CodecError),

    /// Topic fan-out could not reach every subscription
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl HandlerError {
    pub fn disposition(&self) -> Disposition {
        match self {
            HandlerError::Validation(_) => Disposition::DeadLetter,
            HandlerError::Update(failure) if failure.is_retryable() => Disposition::Retry,
            HandlerError::Update(_) => Disposition::Drop,
            HandlerError::Store(e) if e.is_transient() => Disposition::Retry,
            HandlerError::Store(_) => Disposition::Drop,
            HandlerError::Codec(_) => Disposition::Drop,
            HandlerError::Delivery(_) => Disposition::Retry,
        }
    }

    /// Short reason stamped on requeued and dead-lettered messages.
    pub fn reason(&self) -> String {
        match self {
            HandlerError::Validation(failure) => failure.reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Processes one message from a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Drains a topic stream into its subscriptions.
pub struct TopicHandler {
    router: Arc<Router>,
}

impl TopicHandler {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for TopicHandler {
    fn name(&self) -> &str {
        "topic"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let result = self.router.route(envelope).await;
        debug!(
            message_id = %envelope.message_id,
            delivered = result.delivered.len(),
            filtered_out = result.filtered_out.len(),
            "Topic message fanned out"
        );

        if result.is_success() {
            return Ok(());
        }

        let failures: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
        Err(HandlerError::Delivery(failures.join("; ")))
    }
}
