//! Shutter pipeline runner.
//!
//! Starts a consumer pool for every queue of the topology and runs until
//! Ctrl-C or SIGTERM.
//!
//! ## Configuration
//!
//! - `SHUTTER_CONFIG`: config file (default: `config/shutter.toml`)
//! - `REDIS_URL`: Redis connection string; without it the pipeline runs in memory
//! - `TABLE_NAME`: record table (default: `Images`)
//! - `SHUTTER_WORKER_NAME`: consumer name (default: hostname or UUID)
//! - `NOTIFY_RECIPIENT`, `NOTIFY_SENDER`, `SOURCE_BUCKET`: notification addressing
//! - `RUST_LOG`: logging level (default: "info")

use deadpool_redis::{Config, Runtime};
use shutter::consumer::ConsumerStats;
use shutter::shutdown::ShutdownSignal;
use shutter::store::{InMemoryRecordStore, RecordStore, RedisRecordStore};
use shutter::{Pipeline, ShutterConfig};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ShutterConfig::load()?;
    let notifier = config.build_notifier();

    let pipeline = match &config.redis.url {
        Some(url) => {
            let pool = Config::from_url(url.as_str()).create_pool(Some(Runtime::Tokio1))?;
            let store: Arc<dyn RecordStore> =
                Arc::new(RedisRecordStore::new(pool.clone(), &config.store.table_name));
            Pipeline::redis(&config, pool, store, notifier).await?
        }
        None => {
            warn!("REDIS_URL not set, running the pipeline in memory");
            let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new(&config.store.table_name));
            Pipeline::in_memory(&config, store, notifier)?
        }
    };

    info!(
        worker_name = %config.worker_name(),
        table = %config.store.table_name,
        notifier = %config.notifier.kind,
        "Shutter starting"
    );

    let shutdown = ShutdownSignal::new();
    let handles = pipeline.spawn(shutdown.clone());
    info!(workers = handles.len(), "Consumers running");

    shutdown.wait().await;

    let deadline = Instant::now() + shutdown.timeout();
    let mut total = ConsumerStats::default();
    let mut unfinished = 0;

    for handle in handles {
        match timeout_at(deadline, handle).await {
            Ok(Ok(stats)) => total.merge(stats),
            Ok(Err(e)) => error!(error = %e, "Consumer task failed"),
            Err(_) => unfinished += 1,
        }
    }

    if unfinished > 0 {
        warn!(
            unfinished = unfinished,
            timeout_secs = shutdown.timeout().as_secs(),
            "Shutdown timeout reached, abandoning consumers"
        );
    }

    info!(
        received = total.received,
        succeeded = total.succeeded,
        retried = total.retried,
        dead_lettered = total.dead_lettered,
        dropped = total.dropped,
        "Shutter shutdown complete"
    );
    Ok(())
}
