//! Queues with at-least-once delivery.
//!
//! A [`MessageQueue`] hands out [`Delivery`] values. Each delivery stays
//! invisible to other consumers until it is acknowledged, negatively
//! acknowledged, dead-lettered, or its visibility timeout expires.
//!
//! ```text
//!            send                receive              ack
//!  producer ──────▶ [visible] ───────────▶ [in flight] ─────▶ (deleted)
//!                       ▲                      │
//!                       │  nack / timeout      │  nack / timeout with
//!                       └──────────────────────┤  receive_count >= max
//!                                              ▼
//!                                       dead-letter queue
//! ```
//!
//! Back ends:
//!
//! - [`InMemoryQueue`]: in-process, used for tests and the demo mode
//! - [`RedisStreamQueue`]: one Redis stream per queue, consumer groups

pub mod memory;
pub mod redis;

use crate::event::{CodecError, Envelope};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryQueue;
pub use redis::RedisStreamQueue;

/// Errors raised by queue back ends.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The receipt was already settled or its visibility timeout expired
    #[error("receipt '{0}' is unknown or no longer in flight")]
    StaleReceipt(String),

    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Redis(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A received message, owned by the consumer until settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope,

    /// Opaque handle used to settle this delivery
    pub receipt: String,

    /// How many times this message has been received, including this time
    pub receive_count: u32,
}

/// What happened to a message that was not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Visible again for another receive
    Requeued,
    /// Moved to the dead-letter queue
    DeadLettered,
    /// Retry budget exhausted and no dead-letter queue configured
    Discarded,
}

/// The queue interface every consumer is written against.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a message.
    async fn send(&self, envelope: Envelope) -> Result<(), QueueError>;

    /// Receive up to `max` messages, waiting at most `wait` for the first one.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Delete a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Report a processing failure; the message is redelivered or, once its
    /// retry budget is spent, dead-lettered.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError>;

    /// Move a delivered message straight to the dead-letter queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError>;

    /// Messages held, visible or in flight.
    async fn depth(&self) -> Result<usize, QueueError>;
}
