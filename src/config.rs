//! Configuration for the pipeline.
//!
//! Loads configuration from TOML files with environment variable
//! substitution, then applies a handful of plain environment overrides.
//!
//! # Example
//!
//! ```toml
//! [store]
//! table_name = "Images"
//!
//! [notifier]
//! kind = "webhook"
//! recipient = "${NOTIFY_RECIPIENT}"
//! webhook_url = "${MAIL_RELAY_URL}"
//!
//! [queues.images]
//! max_concurrency = 2
//! max_batching_window_ms = 5000
//! max_receive_count = 1
//! ```

use crate::event::{MetadataAttribute, METADATA_TYPE_ATTRIBUTE};
use crate::filter::FilterPredicate;
use crate::notify::{Addressing, LogNotifier, MemoryNotifier, Notifier, WebhookNotifier};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/shutter.toml";

/// Largest batch a consumer may request.
pub const MAX_BATCH_SIZE: usize = 10;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ShutterConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub filters: FilterConfig,

    #[serde(default)]
    pub schemas: SchemaConfig,

    #[serde(default)]
    pub queues: QueuesConfig,
}

/// Redis configuration. Without a URL the pipeline runs in memory.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Streams are named `<prefix>:<queue>`
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            consumer_group: default_consumer_group(),
            stream_prefix: default_stream_prefix(),
        }
    }
}

fn default_consumer_group() -> String {
    "shutter_workers".to_string()
}

fn default_stream_prefix() -> String {
    "shutter".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
        }
    }
}

fn default_table_name() -> String {
    "Images".to_string()
}

/// Notifier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    /// "log" (default), "webhook" or "memory"
    #[serde(default = "default_notifier_kind")]
    pub kind: String,

    #[serde(default = "default_recipient")]
    pub recipient: String,

    #[serde(default = "default_sender")]
    pub sender: String,

    #[serde(default = "default_source_bucket")]
    pub source_bucket: String,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: default_notifier_kind(),
            recipient: default_recipient(),
            sender: default_sender(),
            source_bucket: default_source_bucket(),
            webhook_url: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_notifier_kind() -> String {
    "log".to_string()
}

fn default_recipient() -> String {
    "owner@localhost".to_string()
}

fn default_sender() -> String {
    "album@localhost".to_string()
}

fn default_source_bucket() -> String {
    "images".to_string()
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    1
}

/// Allowlist for the metadata subscription
#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_metadata_types")]
    pub metadata_types: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            metadata_types: default_metadata_types(),
        }
    }
}

fn default_metadata_types() -> Vec<String> {
    MetadataAttribute::ALL.iter().map(|a| a.as_str().to_string()).collect()
}

/// Extra schema documents
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchemaConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Per-queue consumer and redelivery settings.
///
/// Fields missing from a `[queues.<name>]` table fall back to the generic
/// defaults of [`QueueSettings::default`], not to that queue's defaults.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub max_batching_window_ms: u64,
    pub max_receive_count: u32,
    pub visibility_timeout_ms: u64,
    pub invocation_timeout_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            batch_size: 1,
            max_batching_window_ms: 0,
            max_receive_count: 3,
            visibility_timeout_ms: 30000,
            invocation_timeout_ms: 15000,
        }
    }
}

impl QueueSettings {
    pub fn max_batching_window(&self) -> Duration {
        Duration::from_millis(self.max_batching_window_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    fn validate(&self, queue: &str) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Queue '{}' max_concurrency must be at least 1",
                queue
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "Queue '{}' batch_size must be between 1 and {}",
                queue, MAX_BATCH_SIZE
            )));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Queue '{}' max_receive_count must be at least 1",
                queue
            )));
        }
        if self.invocation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Queue '{}' invocation_timeout_ms must be positive",
                queue
            )));
        }
        if self.visibility_timeout_ms < self.invocation_timeout_ms {
            warn!(
                queue = %queue,
                visibility_timeout_ms = self.visibility_timeout_ms,
                invocation_timeout_ms = self.invocation_timeout_ms,
                "Visibility timeout shorter than invocation timeout, messages may be processed twice"
            );
        }
        Ok(())
    }
}

/// Settings for every queue of the fixed topology
#[derive(Debug, Deserialize, Clone)]
pub struct QueuesConfig {
    #[serde(default = "default_topic_queue")]
    pub topic: QueueSettings,

    #[serde(default = "default_images_queue")]
    pub images: QueueSettings,

    #[serde(default = "default_bad_images_queue")]
    pub bad_images: QueueSettings,

    #[serde(default = "default_metadata_queue")]
    pub metadata: QueueSettings,

    #[serde(default = "default_mailer_queue")]
    pub mailer: QueueSettings,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            topic: default_topic_queue(),
            images: default_images_queue(),
            bad_images: default_bad_images_queue(),
            metadata: default_metadata_queue(),
            mailer: default_mailer_queue(),
        }
    }
}

fn default_topic_queue() -> QueueSettings {
    QueueSettings {
        batch_size: MAX_BATCH_SIZE,
        max_receive_count: 5,
        ..QueueSettings::default()
    }
}

fn default_images_queue() -> QueueSettings {
    QueueSettings {
        max_concurrency: 2,
        max_batching_window_ms: 5000,
        max_receive_count: 1,
        ..QueueSettings::default()
    }
}

fn default_bad_images_queue() -> QueueSettings {
    QueueSettings {
        max_concurrency: 2,
        max_batching_window_ms: 10000,
        ..QueueSettings::default()
    }
}

fn default_metadata_queue() -> QueueSettings {
    QueueSettings {
        invocation_timeout_ms: 3000,
        ..QueueSettings::default()
    }
}

fn default_mailer_queue() -> QueueSettings {
    QueueSettings {
        batch_size: 5,
        max_batching_window_ms: 5000,
        ..QueueSettings::default()
    }
}

impl ShutterConfig {
    /// Load configuration from the default path or the SHUTTER_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SHUTTER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path, then apply env overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            let content = substitute_env_vars(&content);

            debug!("Parsing TOML configuration");
            toml::from_str(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        info!(
            table = %config.store.table_name,
            notifier = %config.notifier.kind,
            redis = config.redis.url.is_some(),
            metadata_types = ?config.filters.metadata_types,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Plain environment variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(table) = env::var("TABLE_NAME") {
            self.store.table_name = table;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Ok(name) = env::var("SHUTTER_WORKER_NAME") {
            self.worker.name = Some(name);
        }
        if let Ok(recipient) = env::var("NOTIFY_RECIPIENT") {
            self.notifier.recipient = recipient;
        }
        if let Ok(sender) = env::var("NOTIFY_SENDER") {
            self.notifier.sender = sender;
        }
        if let Ok(bucket) = env::var("SOURCE_BUCKET") {
            self.notifier.source_bucket = bucket;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.table_name.is_empty() {
            return Err(ConfigError::MissingField("store.table_name".into()));
        }

        match self.notifier.kind.as_str() {
            "log" | "memory" => {}
            "webhook" => {
                let url = self
                    .notifier
                    .webhook_url
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField("notifier.webhook_url".into()))?;

                if url.contains("${") {
                    warn!(url = %url, "Webhook URL contains unsubstituted environment variable");
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::ValidationError(
                        "notifier.webhook_url must start with http:// or https://".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "notifier.kind must be 'log', 'webhook' or 'memory', got '{}'",
                    other
                )));
            }
        }

        for value in &self.filters.metadata_types {
            value
                .parse::<MetadataAttribute>()
                .map_err(ConfigError::ValidationError)?;
        }

        for (name, queue) in self.queues.iter() {
            queue.validate(name)?;
        }

        Ok(())
    }

    /// The metadata subscription's filter.
    pub fn metadata_filter(&self) -> FilterPredicate {
        FilterPredicate::allowlist(METADATA_TYPE_ATTRIBUTE, self.filters.metadata_types.iter().cloned())
    }

    pub fn addressing(&self) -> Addressing {
        Addressing::new(
            &self.notifier.recipient,
            &self.notifier.sender,
            &self.notifier.source_bucket,
        )
    }

    /// Worker name from config, else the hostname, else a random id.
    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.worker.name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("worker-{}", name);
            }
        }

        format!("worker-{}", uuid::Uuid::new_v4())
    }

    /// Build the configured notifier.
    pub fn build_notifier(&self) -> Arc<dyn Notifier> {
        match (self.notifier.kind.as_str(), &self.notifier.webhook_url) {
            ("webhook", Some(url)) => Arc::new(
                WebhookNotifier::new(url)
                    .with_timeout(Duration::from_millis(self.notifier.timeout_ms))
                    .with_retries(self.notifier.retries),
            ),
            ("memory", _) => Arc::new(MemoryNotifier::new()),
            _ => Arc::new(LogNotifier::with_prefix("mail")),
        }
    }
}

impl QueuesConfig {
    /// Every queue with its configuration name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &QueueSettings)> {
        [
            ("topic", &self.topic),
            ("images", &self.images),
            ("bad_images", &self.bad_images),
            ("metadata", &self.metadata),
            ("mailer", &self.mailer),
        ]
        .into_iter()
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
