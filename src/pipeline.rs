//! The fixed pipeline topology.
//!
//! ```text
//!                         ┌──────────────► images ──► ValidationHandler ──► RecordStore
//!                         │                  │                  │
//!                         │                  │                  └─(inserted)─► mailer ──► ConfirmationHandler ──► Notifier
//!                         │                  │
//!                         │                  └─(redrive)─► bad-images ──► RejectionHandler ──► Notifier
//!  upload / metadata ──► topic
//!                         └─(metadata_type)─► metadata-updates ──► MetadataHandler ──► RecordStore
//! ```
//!
//! The mailer queue has no topic subscription: only records the validation
//! worker actually inserted are confirmed.
//!
//! [`Pipeline::publish`] fans a message out directly. Producers in other
//! processes append to the `topic` queue instead, which a [`TopicHandler`]
//! drains into the same subscriptions.

use crate::config::{QueueSettings, ShutterConfig};
use crate::consumer::{Consumer, ConsumerSettings, ConsumerStats};
use crate::dlq::RedrivePolicy;
use crate::event::{storage_notifications, CodecError, Envelope};
use crate::notify::Notifier;
use crate::queue::{InMemoryQueue, MessageQueue, QueueError, RedisStreamQueue};
use crate::router::{RouteResult, Router};
use crate::schema::{SchemaFailure, SchemaRegistry};
use crate::shutdown::ShutdownSignal;
use crate::store::RecordStore;
use crate::workers::{
    ConfirmationHandler, MessageHandler, MetadataHandler, MetadataUpdater, RejectionHandler,
    TopicHandler, ValidationHandler, Validator,
};
use deadpool_redis::Pool;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const TOPIC_QUEUE: &str = "topic";
pub const IMAGES_QUEUE: &str = "images";
pub const BAD_IMAGES_QUEUE: &str = "bad-images";
pub const METADATA_QUEUE: &str = "metadata-updates";
pub const MAILER_QUEUE: &str = "mailer";

/// Upper bound on polling rounds in [`Pipeline::drain`].
const MAX_DRAIN_ROUNDS: usize = 1000;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to load schemas: {0}")]
    Schema(#[from] SchemaFailure),

    #[error("failed to open queue: {0}")]
    Queue(#[from] QueueError),
}

/// The five queues of the pipeline.
#[derive(Clone)]
pub struct Topology {
    pub topic: Arc<dyn MessageQueue>,
    pub images: Arc<dyn MessageQueue>,
    pub bad_images: Arc<dyn MessageQueue>,
    pub metadata: Arc<dyn MessageQueue>,
    pub mailer: Arc<dyn MessageQueue>,
}

impl Topology {
    /// In-process queues.
    pub fn in_memory(config: &ShutterConfig) -> Self {
        let queues = &config.queues;
        let memory = |name: &str, settings: &QueueSettings, redrive: RedrivePolicy| -> Arc<dyn MessageQueue> {
            Arc::new(
                InMemoryQueue::new(name)
                    .with_visibility_timeout(settings.visibility_timeout())
                    .with_redrive(redrive),
            )
        };

        let bad_images = memory(
            BAD_IMAGES_QUEUE,
            &queues.bad_images,
            RedrivePolicy::new(queues.bad_images.max_receive_count),
        );

        Self {
            topic: memory(TOPIC_QUEUE, &queues.topic, RedrivePolicy::new(queues.topic.max_receive_count)),
            images: memory(
                IMAGES_QUEUE,
                &queues.images,
                RedrivePolicy::new(queues.images.max_receive_count).with_dead_letter(bad_images.clone()),
            ),
            metadata: memory(
                METADATA_QUEUE,
                &queues.metadata,
                RedrivePolicy::new(queues.metadata.max_receive_count),
            ),
            mailer: memory(MAILER_QUEUE, &queues.mailer, RedrivePolicy::new(queues.mailer.max_receive_count)),
            bad_images,
        }
    }

    /// One Redis stream per queue, named `<stream_prefix>:<queue>`.
    pub async fn redis(config: &ShutterConfig, pool: Pool) -> Result<Self, QueueError> {
        let queues = &config.queues;
        let consumer = config.worker_name();

        let open = |name: &'static str, settings: QueueSettings, redrive: RedrivePolicy| {
            let pool = pool.clone();
            let stream = format!("{}:{}", config.redis.stream_prefix, name);
            let group = config.redis.consumer_group.clone();
            let consumer = consumer.clone();
            async move {
                let queue = RedisStreamQueue::connect(pool, name, stream, group, consumer)
                    .await?
                    .with_visibility_timeout(settings.visibility_timeout())
                    .with_redrive(redrive);
                Ok::<Arc<dyn MessageQueue>, QueueError>(Arc::new(queue))
            }
        };

        let bad_images = open(
            BAD_IMAGES_QUEUE,
            queues.bad_images.clone(),
            RedrivePolicy::new(queues.bad_images.max_receive_count),
        )
        .await?;

        Ok(Self {
            topic: open(
                TOPIC_QUEUE,
                queues.topic.clone(),
                RedrivePolicy::new(queues.topic.max_receive_count),
            )
            .await?,
            images: open(
                IMAGES_QUEUE,
                queues.images.clone(),
                RedrivePolicy::new(queues.images.max_receive_count).with_dead_letter(bad_images.clone()),
            )
            .await?,
            metadata: open(
                METADATA_QUEUE,
                queues.metadata.clone(),
                RedrivePolicy::new(queues.metadata.max_receive_count),
            )
            .await?,
            mailer: open(
                MAILER_QUEUE,
                queues.mailer.clone(),
                RedrivePolicy::new(queues.mailer.max_receive_count),
            )
            .await?,
            bad_images,
        })
    }

    /// The topic's subscriptions.
    pub fn router(&self, config: &ShutterConfig) -> Router {
        let mut router = Router::new();
        router.subscribe(IMAGES_QUEUE, self.images.clone());
        router.subscribe_filtered(METADATA_QUEUE, config.metadata_filter(), self.metadata.clone());
        router
    }
}

/// Queues, subscriptions and consumers wired together.
pub struct Pipeline {
    topology: Topology,
    router: Arc<Router>,
    store: Arc<dyn RecordStore>,
    consumers: Vec<Arc<Consumer>>,
}

impl Pipeline {
    /// Everything in process; used by tests and the demo mode.
    pub fn in_memory(
        config: &ShutterConfig,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PipelineError> {
        Self::assemble(config, Topology::in_memory(config), store, notifier)
    }

    /// Queues on Redis streams.
    pub async fn redis(
        config: &ShutterConfig,
        pool: Pool,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PipelineError> {
        let topology = Topology::redis(config, pool).await?;
        Self::assemble(config, topology, store, notifier)
    }

    fn assemble(
        config: &ShutterConfig,
        topology: Topology,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, PipelineError> {
        let mut schemas = SchemaRegistry::with_builtin();
        if let Some(dir) = &config.schemas.dir {
            schemas.load_dir(dir)?;
        }

        let router = Arc::new(topology.router(config));
        let addressing = config.addressing();
        let queues = &config.queues;

        let wire = |queue: &Arc<dyn MessageQueue>, handler: Arc<dyn MessageHandler>, settings: &QueueSettings| {
            Arc::new(Consumer::new(queue.clone(), handler, ConsumerSettings::from(settings)))
        };

        let consumers = vec![
            wire(&topology.topic, Arc::new(TopicHandler::new(router.clone())), &queues.topic),
            wire(
                &topology.images,
                Arc::new(
                    ValidationHandler::new(Validator::new(), store.clone())
                        .with_confirmations(topology.mailer.clone()),
                ),
                &queues.images,
            ),
            wire(
                &topology.metadata,
                Arc::new(MetadataHandler::new(MetadataUpdater::new(store.clone()), Arc::new(schemas))),
                &queues.metadata,
            ),
            wire(
                &topology.mailer,
                Arc::new(ConfirmationHandler::new(notifier.clone(), addressing.clone())),
                &queues.mailer,
            ),
            wire(
                &topology.bad_images,
                Arc::new(RejectionHandler::new(notifier, addressing)),
                &queues.bad_images,
            ),
        ];

        info!(
            subscriptions = router.subscriptions().len(),
            consumers = consumers.len(),
            table = %store.table(),
            "Pipeline assembled"
        );

        Ok(Self {
            topology,
            router,
            store,
            consumers,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Fan `envelope` out to the subscriptions right away.
    pub async fn publish(&self, envelope: Envelope) -> RouteResult {
        self.router.route(&envelope).await
    }

    /// Append `envelope` to the topic queue for a consumer to fan out.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.topology.topic.send(envelope).await
    }

    /// Publish every upload carried by a storage-layer notification body.
    pub async fn publish_storage_event(&self, body: &str) -> Result<RouteResult, CodecError> {
        let mut result = RouteResult::default();
        for notification in storage_notifications(body)? {
            result.merge(self.publish(Envelope::upload(&notification)).await);
        }
        Ok(result)
    }

    /// Start every consumer's worker tasks.
    pub fn spawn(&self, shutdown: ShutdownSignal) -> Vec<JoinHandle<ConsumerStats>> {
        self.consumers
            .iter()
            .flat_map(|consumer| consumer.spawn(shutdown.clone()))
            .collect()
    }

    /// Poll every consumer until no queue yields a message.
    pub async fn drain(&self) -> ConsumerStats {
        let mut total = ConsumerStats::default();

        for _ in 0..MAX_DRAIN_ROUNDS {
            let mut round = ConsumerStats::default();
            for consumer in &self.consumers {
                round.merge(consumer.poll_once().await);
            }
            total.merge(round);

            if round.received == 0 {
                return total;
            }
        }

        warn!(rounds = MAX_DRAIN_ROUNDS, "Pipeline still busy after drain limit");
        total
    }
}
