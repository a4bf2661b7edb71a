//! Topic Router - fan-out of topic messages to subscribed queues.
//!
//! The [`Router`] holds the topic's subscriptions. Publishing an envelope
//! delivers an independent copy to every subscription whose filter accepts
//! it. A subscription without a filter accepts everything.
//!
//! # Architecture
//!
//! ```text
//! Envelope (metadata_type: "Caption")
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────┐
//! │                  ROUTER                      │
//! │                                              │
//! │  images            (no filter)      -> copy  │
//! │  metadata-updates  metadata_type in -> copy  │
//! │                    [Caption, Date, ...]      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A failed delivery to one subscription never prevents delivery to the
//! others; the failures are collected in the [`RouteResult`].
//!
//! # Example
//!
//! ```rust,ignore
//! use shutter::router::Router;
//! use shutter::filter::FilterPredicate;
//! use shutter::queue::InMemoryQueue;
//! use std::sync::Arc;
//!
//! let mut router = Router::new();
//! router.subscribe("images", Arc::new(InMemoryQueue::new("images")));
//! router.subscribe_filtered(
//!     "metadata-updates",
//!     FilterPredicate::metadata_types(),
//!     Arc::new(InMemoryQueue::new("metadata-updates")),
//! );
//! ```

use crate::event::Envelope;
use crate::filter::FilterPredicate;
use crate::queue::{MessageQueue, QueueError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during routing.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Delivery to one subscription failed
    #[error("delivery to subscription '{subscription}' failed: {source}")]
    DeliveryFailed {
        subscription: String,
        #[source]
        source: QueueError,
    },
}

/// Outcome of routing one envelope.
#[derive(Debug, Default)]
pub struct RouteResult {
    /// Subscriptions that received a copy
    pub delivered: Vec<String>,

    /// Subscriptions whose filter rejected the envelope
    pub filtered_out: Vec<String>,

    /// Deliveries that failed
    pub errors: Vec<RouterError>,
}

impl RouteResult {
    /// Returns true if every matching subscription received its copy
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.errors.len()
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: RouteResult) {
        self.delivered.extend(other.delivered);
        self.filtered_out.extend(other.filtered_out);
        self.errors.extend(other.errors);
    }
}

/// A queue subscribed to the topic, optionally behind a filter.
#[derive(Clone)]
pub struct Subscription {
    pub name: String,
    pub filter: Option<FilterPredicate>,
    pub target: Arc<dyn MessageQueue>,
}

impl Subscription {
    /// Whether this subscription wants `envelope`.
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(envelope))
    }
}

/// Topic router. Wrap in `Arc` to share across tasks.
#[derive(Clone, Default)]
pub struct Router {
    subscriptions: Vec<Subscription>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a queue that receives every message.
    pub fn subscribe(&mut self, name: impl Into<String>, target: Arc<dyn MessageQueue>) {
        self.add(Subscription {
            name: name.into(),
            filter: None,
            target,
        });
    }

    /// Subscribe a queue that receives only messages matching `filter`.
    pub fn subscribe_filtered(
        &mut self,
        name: impl Into<String>,
        filter: FilterPredicate,
        target: Arc<dyn MessageQueue>,
    ) {
        self.add(Subscription {
            name: name.into(),
            filter: Some(filter),
            target,
        });
    }

    fn add(&mut self, subscription: Subscription) {
        debug!(
            subscription = %subscription.name,
            queue = %subscription.target.name(),
            filter = %subscription.filter.as_ref().map(|f| f.to_string()).unwrap_or_else(|| "none".into()),
            "Registering subscription"
        );
        self.subscriptions.push(subscription);
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Names of the subscriptions that would receive `envelope`.
    pub fn matching(&self, envelope: &Envelope) -> Vec<&str> {
        self.subscriptions
            .iter()
            .filter(|s| s.accepts(envelope))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Deliver a copy of `envelope` to every accepting subscription.
    pub async fn route(&self, envelope: &Envelope) -> RouteResult {
        let mut result = RouteResult::default();

        for subscription in &self.subscriptions {
            if !subscription.accepts(envelope) {
                debug!(
                    subscription = %subscription.name,
                    message_id = %envelope.message_id,
                    "Filtered out"
                );
                result.filtered_out.push(subscription.name.clone());
                continue;
            }

            match subscription.target.send(envelope.copy()).await {
                Ok(()) => result.delivered.push(subscription.name.clone()),
                Err(e) => {
                    warn!(
                        subscription = %subscription.name,
                        message_id = %envelope.message_id,
                        error = %e,
                        "Delivery failed"
                    );
                    result.errors.push(RouterError::DeliveryFailed {
                        subscription: subscription.name.clone(),
                        source: e,
                    });
                }
            }
        }

        if result.delivered.is_empty() && result.errors.is_empty() {
            warn!(message_id = %envelope.message_id, "No subscription accepted message");
        } else {
            info!(
                message_id = %envelope.message_id,
                delivered = ?result.delivered,
                failures = result.errors.len(),
                "Message routed"
            );
        }

        result
    }
}
