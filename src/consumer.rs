//! Worker runtime: pulls batches from a queue and settles every message.
//!
//! A [`Consumer`] pairs a queue with its [`MessageHandler`]. Spawning it
//! starts `max_concurrency` independent worker tasks. Each task:
//!
//! 1. Receives up to `batch_size` messages, waiting at most
//!    `max_batching_window` for the batch to fill
//! 2. Runs the handler on each message under `invocation_timeout`
//! 3. Settles the message from the outcome
//!
//! ```text
//! Ok                      -> ack
//! Err, Disposition::Retry -> nack       (redrive policy may dead-letter)
//! Err, DeadLetter         -> dead_letter
//! Err, Drop               -> ack + warn
//! timeout                 -> nack
//! ```

use crate::config::QueueSettings;
use crate::queue::{Delivery, MessageQueue, NackOutcome, QueueError};
use crate::shutdown::ShutdownSignal;
use crate::workers::{Disposition, MessageHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// How long one receive call blocks waiting for the first message.
const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

/// Delay before retrying after a queue error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Log worker statistics every this many received messages.
const STATS_INTERVAL: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub max_batching_window: Duration,
    pub max_concurrency: usize,
    pub invocation_timeout: Duration,
    pub receive_wait: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for ConsumerSettings {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            max_batching_window: settings.max_batching_window(),
            max_concurrency: settings.max_concurrency.max(1),
            invocation_timeout: settings.invocation_timeout(),
            receive_wait: DEFAULT_RECEIVE_WAIT,
        }
    }
}

/// Counters for one worker task or one polled batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

impl ConsumerStats {
    pub fn merge(&mut self, other: ConsumerStats) {
        self.received += other.received;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.dropped += other.dropped;
    }

    fn record(&mut self, outcome: NackOutcome) {
        match outcome {
            NackOutcome::Requeued => self.retried += 1,
            NackOutcome::DeadLettered => self.dead_lettered += 1,
            NackOutcome::Discarded => self.dropped += 1,
        }
    }
}

/// A queue and the handler that consumes it.
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            handler,
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Start `max_concurrency` worker tasks. Each returns its stats on shutdown.
    pub fn spawn(self: &Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<ConsumerStats>> {
        (0..self.settings.max_concurrency)
            .map(|instance| {
                let consumer = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { consumer.run(instance, shutdown).await })
            })
            .collect()
    }

    /// Process whatever is immediately available, without waiting.
    pub async fn poll_once(&self) -> ConsumerStats {
        match self.queue.receive(self.settings.batch_size, Duration::ZERO).await {
            Ok(batch) => self.process_batch(batch).await,
            Err(e) => {
                error!(queue = %self.queue.name(), error = %e, "Receive failed");
                ConsumerStats::default()
            }
        }
    }

    async fn run(self: Arc<Self>, instance: usize, shutdown: ShutdownSignal) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut next_report = STATS_INTERVAL;

        info!(
            queue = %self.queue.name(),
            handler = %self.handler.name(),
            instance = instance,
            batch_size = self.settings.batch_size,
            "Consumer started"
        );

        while !shutdown.is_shutdown() {
            let batch = match self.collect_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(queue = %self.queue.name(), error = %e, "Receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                    }
                }
            };

            if batch.is_empty() {
                continue;
            }

            stats.merge(self.process_batch(batch).await);

            if stats.received >= next_report {
                next_report = stats.received + STATS_INTERVAL;
                info!(
                    queue = %self.queue.name(),
                    instance = instance,
                    received = stats.received,
                    succeeded = stats.succeeded,
                    retried = stats.retried,
                    dead_lettered = stats.dead_lettered,
                    dropped = stats.dropped,
                    "Consumer statistics"
                );
            }
        }

        info!(
            queue = %self.queue.name(),
            instance = instance,
            received = stats.received,
            succeeded = stats.succeeded,
            "Consumer stopped"
        );
        stats
    }

    /// Wait for a first message, then keep filling the batch until it is
    /// full or the batching window closes.
    async fn collect_batch(&self) -> Result<Vec<Delivery>, QueueError> {
        let max = self.settings.batch_size;
        let mut batch = self.queue.receive(max, self.settings.receive_wait).await?;

        if batch.is_empty() || self.settings.max_batching_window.is_zero() {
            return Ok(batch);
        }

        let window_closes = Instant::now() + self.settings.max_batching_window;
        while batch.len() < max {
            let remaining = window_closes.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let more = self.queue.receive(max - batch.len(), remaining).await?;
            if more.is_empty() {
                break;
            }
            batch.extend(more);
        }

        debug!(queue = %self.queue.name(), size = batch.len(), "Batch collected");
        Ok(batch)
    }

    async fn process_batch(&self, batch: Vec<Delivery>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        for delivery in batch {
            stats.received += 1;
            if let Err(e) = self.process(&delivery, &mut stats).await {
                error!(
                    queue = %self.queue.name(),
                    message_id = %delivery.envelope.message_id,
                    error = %e,
                    "Failed to settle message"
                );
            }
        }
        stats
    }

    async fn process(&self, delivery: &Delivery, stats: &mut ConsumerStats) -> Result<(), QueueError> {
        let queue = self.queue.name();
        let message_id = &delivery.envelope.message_id;

        debug!(
            queue = %queue,
            message_id = %message_id,
            receive_count = delivery.receive_count,
            "Processing message"
        );

        let outcome = timeout(self.settings.invocation_timeout, self.handler.handle(&delivery.envelope)).await;

        match outcome {
            Ok(Ok(())) => {
                self.queue.ack(delivery).await?;
                stats.succeeded += 1;
            }
            Ok(Err(e)) => match e.disposition() {
                Disposition::Retry => {
                    warn!(queue = %queue, message_id = %message_id, error = %e, "Processing failed, will retry");
                    stats.record(self.queue.nack(delivery, &e.reason()).await?);
                }
                Disposition::DeadLetter => {
                    warn!(queue = %queue, message_id = %message_id, error = %e, "Processing failed permanently");
                    stats.record(self.queue.dead_letter(delivery, &e.reason()).await?);
                }
                Disposition::Drop => {
                    warn!(queue = %queue, message_id = %message_id, error = %e, "Dropping message");
                    self.queue.ack(delivery).await?;
                    stats.dropped += 1;
                }
            },
            Err(_) => {
                let reason = format!(
                    "invocation timed out after {}ms",
                    self.settings.invocation_timeout.as_millis()
                );
                warn!(queue = %queue, message_id = %message_id, "Handler timed out");
                stats.record(self.queue.nack(delivery, &reason).await?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DeadLetterInfo, RedrivePolicy};
    use crate::event::Envelope;
    use crate::queue::InMemoryQueue;
    use crate::workers::{HandlerError, ValidationFailure};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Behaviour keyed on the message body.
    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match envelope.body.as_str() {
                "ok" => Ok(()),
                "invalid" => Err(ValidationFailure::new("invalid", "unsupported extension").into()),
                "transient" => Err(crate::store::StoreError::Unavailable("down".into()).into()),
                "garbage" => Err(crate::event::CodecError::Unclassified.into()),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn setup(max_receive_count: u32) -> (Arc<InMemoryQueue>, Arc<InMemoryQueue>, Consumer, Arc<ScriptedHandler>) {
        let dlq = Arc::new(InMemoryQueue::new("dlq"));
        let queue = Arc::new(
            InMemoryQueue::new("work")
                .with_redrive(RedrivePolicy::new(max_receive_count).with_dead_letter(dlq.clone())),
        );
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
        });
        let settings = ConsumerSettings {
            batch_size: 10,
            invocation_timeout: Duration::from_millis(100),
            ..ConsumerSettings::default()
        };
        let consumer = Consumer::new(queue.clone(), handler.clone(), settings);
        (queue, dlq, consumer, handler)
    }

    #[tokio::test]
    async fn test_success_acks() {
        let (queue, dlq, consumer, _) = setup(3);
        queue.send(Envelope::new("ok")).await.unwrap();

        let stats = consumer.poll_once().await;

        assert_eq!(stats.received, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(dlq.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_dead_letters_immediately() {
        let (queue, dlq, consumer, _) = setup(3);
        queue.send(Envelope::new("invalid")).await.unwrap();

        let stats = consumer.poll_once().await;

        assert_eq!(stats.dead_lettered, 1);
        let dead = dlq.receive(1, Duration::ZERO).await.unwrap();
        let info = DeadLetterInfo::from_envelope(&dead[0].envelope);
        assert_eq!(info.reason.as_deref(), Some("unsupported extension"));
        assert_eq!(info.source_queue.as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_budget() {
        let (queue, dlq, consumer, handler) = setup(2);
        queue.send(Envelope::new("transient")).await.unwrap();

        let first = consumer.poll_once().await;
        assert_eq!(first.retried, 1);
        let second = consumer.poll_once().await;
        assert_eq!(second.dead_lettered, 1);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(dlq.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_codec_failure_is_dropped() {
        let (queue, dlq, consumer, _) = setup(3);
        queue.send(Envelope::new("garbage")).await.unwrap();

        let stats = consumer.poll_once().await;

        assert_eq!(stats.dropped, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(dlq.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (queue, dlq, consumer, _) = setup(1);
        queue.send(Envelope::new("slow")).await.unwrap();

        let stats = consumer.poll_once().await;

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(dlq.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_batch() {
        let (queue, dlq, consumer, _) = setup(1);
        for body in ["ok", "invalid", "ok"] {
            queue.send(Envelope::new(body)).await.unwrap();
        }

        let stats = consumer.poll_once().await;

        assert_eq!(stats.received, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(dlq.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_spawned_workers_stop_on_shutdown() {
        let (queue, _, consumer, _) = setup(3);
        let consumer = Arc::new(Consumer::new(
            queue.clone(),
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
            }),
            ConsumerSettings {
                max_concurrency: 2,
                receive_wait: Duration::from_millis(20),
                ..consumer.settings().clone()
            },
        ));
        queue.send(Envelope::new("ok")).await.unwrap();

        let shutdown = ShutdownSignal::new();
        let handles = consumer.spawn(shutdown.clone());
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();

        let mut total = ConsumerStats::default();
        for handle in handles {
            total.merge(handle.await.unwrap());
        }
        assert_eq!(total.succeeded, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batching_window_collects_late_messages() {
        let queue = Arc::new(InMemoryQueue::new("mailer"));
        let consumer = Consumer::new(
            queue.clone(),
            Arc::new(ScriptedHandler {
                calls: AtomicUsize::new(0),
            }),
            ConsumerSettings {
                batch_size: 5,
                max_batching_window: Duration::from_millis(200),
                receive_wait: Duration::from_millis(50),
                ..ConsumerSettings::default()
            },
        );

        queue.send(Envelope::new("ok")).await.unwrap();
        let late = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            late.send(Envelope::new("ok")).await.unwrap();
        });

        let batch = consumer.collect_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
    }
}
