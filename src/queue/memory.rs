//! In-process queue with visibility timeouts and redrive.

use super::{Delivery, MessageQueue, NackOutcome, QueueError};
use crate::dlq::RedrivePolicy;
use crate::event::Envelope;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time a received message stays hidden from other consumers.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

struct Stored {
    envelope: Envelope,
    receive_count: u32,
}

struct InFlight {
    stored: Stored,
    invisible_until: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: VecDeque<Stored>,
    in_flight: HashMap<String, InFlight>,
}

/// A queue held in process memory.
///
/// Safe to share between any number of concurrent consumers via `Arc`.
pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: RedrivePolicy,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            redrive: RedrivePolicy::unbounded(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = policy;
        self
    }

    pub fn redrive(&self) -> &RedrivePolicy {
        &self.redrive
    }

    /// Move in-flight messages whose visibility expired back to the visible
    /// list. Returns those that exhausted their retry budget instead.
    fn release_expired(&self, state: &mut QueueState) -> Vec<Stored> {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.invisible_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let mut exhausted = Vec::new();
        for receipt in expired {
            if let Some(in_flight) = state.in_flight.remove(&receipt) {
                debug!(
                    queue = %self.name,
                    message_id = %in_flight.stored.envelope.message_id,
                    receive_count = in_flight.stored.receive_count,
                    "Visibility timeout expired"
                );
                if self.redrive.is_exhausted(in_flight.stored.receive_count) {
                    exhausted.push(in_flight.stored);
                } else {
                    state.visible.push_back(in_flight.stored);
                }
            }
        }
        exhausted
    }

    fn take_visible(&self, state: &mut QueueState, max: usize) -> Vec<Delivery> {
        let invisible_until = Instant::now() + self.visibility_timeout;
        let mut deliveries = Vec::new();

        while deliveries.len() < max {
            let Some(mut stored) = state.visible.pop_front() else {
                break;
            };
            stored.receive_count += 1;

            let receipt = Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                envelope: stored.envelope.clone(),
                receipt: receipt.clone(),
                receive_count: stored.receive_count,
            });
            state.in_flight.insert(receipt, InFlight { stored, invisible_until });
        }

        deliveries
    }

    /// Make `stored` visible again.
    async fn restore(&self, stored: Stored) {
        {
            let mut state = self.state.lock().await;
            state.visible.push_back(stored);
        }
        self.available.notify_waiters();
    }

    /// Hand a settled message to the redrive target. When the target refuses
    /// it the message goes back on this queue, so it is never lost.
    async fn forward(&self, stored: Stored, reason: &str) -> Result<NackOutcome, QueueError> {
        match self
            .redrive
            .dead_letter(&self.name, &stored.envelope, stored.receive_count, reason)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    queue = %self.name,
                    message_id = %stored.envelope.message_id,
                    error = %e,
                    "Dead-letter queue refused message, keeping it"
                );
                self.restore(stored).await;
                Err(e)
            }
        }
    }

    async fn settle(&self, delivery: &Delivery) -> Result<Stored, QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&delivery.receipt)
            .map(|f| f.stored)
            .ok_or_else(|| QueueError::StaleReceipt(delivery.receipt.clone()))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.visible.push_back(Stored {
                envelope,
                receive_count: 0,
            });
        }
        self.available.notify_waiters();
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            // Registered before inspecting state so a concurrent send is not missed
            let notified = self.available.notified();

            let (deliveries, exhausted, next_expiry) = {
                let mut state = self.state.lock().await;
                let exhausted = self.release_expired(&mut state);
                let deliveries = self.take_visible(&mut state, max);
                let next_expiry = state.in_flight.values().map(|f| f.invisible_until).min();
                (deliveries, exhausted, next_expiry)
            };

            for stored in exhausted {
                // A refused message is back on the queue and logged
                let _ = self.forward(stored, "visibility timeout expired").await;
            }

            if !deliveries.is_empty() || max == 0 || Instant::now() >= deadline {
                return Ok(deliveries);
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery).await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError> {
        let stored = self.settle(delivery).await?;

        if self.redrive.is_exhausted(stored.receive_count) {
            return self.forward(stored, reason).await;
        }

        debug!(
            queue = %self.name,
            message_id = %stored.envelope.message_id,
            receive_count = stored.receive_count,
            reason = %reason,
            "Message requeued"
        );

        self.restore(stored).await;
        Ok(NackOutcome::Requeued)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError> {
        let stored = self.settle(delivery).await?;
        self.forward(stored, reason).await
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.visible.len() + state.in_flight.len())
    }
}
