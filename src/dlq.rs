//! Dead-lettering for messages that exhaust their retry budget.
//!
//! Each queue carries a [`RedrivePolicy`]: a maximum receive count and an
//! optional dead-letter queue. When a message that has already been received
//! `max_receive_count` times fails again, the policy stamps it with the
//! failure context and moves it to the dead-letter queue.
//!
//! # Stamped attributes
//!
//! ```text
//! failure_reason     last processing failure
//! source_queue       queue the message was dead-lettered from
//! receive_count      receives before dead-lettering
//! dead_lettered_at   RFC 3339 timestamp
//! ```

use crate::event::Envelope;
use crate::queue::{MessageQueue, NackOutcome, QueueError};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

pub const FAILURE_REASON_ATTRIBUTE: &str = "failure_reason";
pub const SOURCE_QUEUE_ATTRIBUTE: &str = "source_queue";
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "receive_count";
pub const DEAD_LETTERED_AT_ATTRIBUTE: &str = "dead_lettered_at";

/// Retry budget and dead-letter target of a queue.
#[derive(Clone)]
pub struct RedrivePolicy {
    max_receive_count: u32,
    dead_letter: Option<Arc<dyn MessageQueue>>,
}

impl RedrivePolicy {
    /// Allow `max_receive_count` receives; exhausted messages are discarded
    /// unless a dead-letter queue is attached.
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: max_receive_count.max(1),
            dead_letter: None,
        }
    }

    /// Redeliver forever.
    pub fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    pub fn with_dead_letter(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter.as_ref().map(|q| q.name())
    }

    /// True when a message received `receive_count` times may not be retried.
    pub fn is_exhausted(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }

    /// Hand a failed message to the dead-letter queue.
    pub async fn dead_letter(
        &self,
        source_queue: &str,
        envelope: &Envelope,
        receive_count: u32,
        reason: &str,
    ) -> Result<NackOutcome, QueueError> {
        let Some(target) = &self.dead_letter else {
            error!(
                queue = %source_queue,
                message_id = %envelope.message_id,
                receive_count = receive_count,
                reason = %reason,
                "Retry budget exhausted and no dead-letter queue configured, discarding message"
            );
            return Ok(NackOutcome::Discarded);
        };

        let stamped = stamp(envelope, source_queue, receive_count, reason);
        target.send(stamped).await?;

        info!(
            queue = %source_queue,
            dead_letter_queue = %target.name(),
            message_id = %envelope.message_id,
            receive_count = receive_count,
            reason = %reason,
            "Message moved to dead-letter queue"
        );

        Ok(NackOutcome::DeadLettered)
    }
}

impl fmt::Debug for RedrivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedrivePolicy")
            .field("max_receive_count", &self.max_receive_count)
            .field("dead_letter", &self.dead_letter_queue())
            .finish()
    }
}

/// Copy of `envelope` carrying the dead-letter attributes.
pub fn stamp(envelope: &Envelope, source_queue: &str, receive_count: u32, reason: &str) -> Envelope {
    envelope
        .clone()
        .with_attribute(FAILURE_REASON_ATTRIBUTE, reason)
        .with_attribute(SOURCE_QUEUE_ATTRIBUTE, source_queue)
        .with_attribute(RECEIVE_COUNT_ATTRIBUTE, receive_count.to_string())
        .with_attribute(DEAD_LETTERED_AT_ATTRIBUTE, Utc::now().to_rfc3339())
}

/// Failure context read back from a dead-lettered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterInfo {
    pub reason: Option<String>,
    pub source_queue: Option<String>,
    pub receive_count: Option<u32>,
}

impl DeadLetterInfo {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            reason: envelope.attribute(FAILURE_REASON_ATTRIBUTE).map(str::to_string),
            source_queue: envelope.attribute(SOURCE_QUEUE_ATTRIBUTE).map(str::to_string),
            receive_count: envelope
                .attribute(RECEIVE_COUNT_ATTRIBUTE)
                .and_then(|n| n.parse().ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use std::time::Duration;

    #[test]
    fn test_exhaustion() {
        let policy = RedrivePolicy::new(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        // Zero is clamped to one receive
        assert!(RedrivePolicy::new(0).is_exhausted(1));
        assert!(!RedrivePolicy::unbounded().is_exhausted(1_000));
    }

    #[test]
    fn test_stamp_roundtrip() {
        let envelope = Envelope::new("{}");
        let stamped = stamp(&envelope, "images", 1, "unsupported extension");
        let info = DeadLetterInfo::from_envelope(&stamped);

        assert_eq!(info.reason.as_deref(), Some("unsupported extension"));
        assert_eq!(info.source_queue.as_deref(), Some("images"));
        assert_eq!(info.receive_count, Some(1));
        assert!(stamped.attribute(DEAD_LETTERED_AT_ATTRIBUTE).is_some());
        assert_eq!(stamped.message_id, envelope.message_id);
    }

    #[tokio::test]
    async fn test_dead_letter_sends_to_target() {
        let dlq = Arc::new(InMemoryQueue::new("bad-images"));
        let policy = RedrivePolicy::new(1).with_dead_letter(dlq.clone());
        assert_eq!(policy.dead_letter_queue(), Some("bad-images"));

        let outcome = policy
            .dead_letter("images", &Envelope::new("{}"), 1, "boom")
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);

        let received = dlq.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].envelope.attribute(FAILURE_REASON_ATTRIBUTE), Some("boom"));
    }

    #[tokio::test]
    async fn test_dead_letter_without_target_discards() {
        let policy = RedrivePolicy::new(1);
        let outcome = policy
            .dead_letter("metadata-updates", &Envelope::new("{}"), 1, "boom")
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::Discarded);
    }
}
