//! Publish messages onto the topic stream.
//!
//! ```text
//! publish upload <object-key>
//! publish metadata <id> <Caption|Date|Photographer> <value>
//! publish image <id> [json-value]
//! publish storage-event <file>
//! ```
//!
//! Requires `REDIS_URL` (or `[redis] url` in the config file).

use deadpool_redis::{Config, Runtime};
use serde_json::Value;
use shutter::event::{
    storage_notifications, Envelope, ImageEvent, MetadataAttribute, MetadataEvent, UploadNotification,
};
use shutter::pipeline::TOPIC_QUEUE;
use shutter::queue::{MessageQueue, RedisStreamQueue};
use shutter::ShutterConfig;
use std::env;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  publish upload <object-key>
  publish metadata <id> <Caption|Date|Photographer> <value>
  publish image <id> [json-value]
  publish storage-event <file>";

/// Turn command-line arguments into envelopes.
fn envelopes(args: &[String]) -> Result<Vec<Envelope>, Box<dyn std::error::Error>> {
    match args {
        [cmd, key] if cmd == "upload" => Ok(vec![Envelope::upload(&UploadNotification::object_created(
            key.as_str(),
        ))]),
        [cmd, id, attribute, value] if cmd == "metadata" => {
            let attribute: MetadataAttribute = attribute.parse()?;
            Ok(vec![Envelope::metadata(&MetadataEvent::new(id.as_str(), attribute, value.as_str()))])
        }
        [cmd, id, rest @ ..] if cmd == "image" && rest.len() <= 1 => {
            let mut event = ImageEvent::new(id.as_str());
            if let Some(raw) = rest.first() {
                event.value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            }
            Ok(vec![Envelope::image(&event)])
        }
        [cmd, path] if cmd == "storage-event" => {
            let body = fs::read_to_string(path)?;
            Ok(storage_notifications(&body)?.iter().map(Envelope::upload).collect())
        }
        _ => Err(USAGE.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let envelopes = envelopes(&args)?;

    let config = ShutterConfig::load()?;
    let url = config.redis.url.as_deref().ok_or("REDIS_URL must be set")?;
    let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;

    let topic = RedisStreamQueue::connect(
        pool,
        TOPIC_QUEUE,
        format!("{}:{}", config.redis.stream_prefix, TOPIC_QUEUE),
        config.redis.consumer_group.clone(),
        config.worker_name(),
    )
    .await?;

    for envelope in envelopes {
        let message_id = envelope.message_id.clone();
        topic.send(envelope).await?;
        info!(message_id = %message_id, stream = %topic.stream(), "Published");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shutter::MessageKind;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_upload_and_metadata() {
        let upload = envelopes(&args(&["upload", "a.png"])).unwrap();
        assert_eq!(upload[0].kind().unwrap(), MessageKind::Upload);

        let metadata = envelopes(&args(&["metadata", "a.png", "Date", "2023-05-01"])).unwrap();
        assert_eq!(metadata[0].attribute("metadata_type"), Some("Date"));
    }

    #[test]
    fn test_image_value() {
        let image = envelopes(&args(&["image", "a.png", "{\"w\":3}"])).unwrap();
        assert!(image[0].body.contains("\"w\":3"));

        let plain = envelopes(&args(&["image", "a.png", "bucket"])).unwrap();
        assert!(plain[0].body.contains("\"bucket\""));
    }

    #[test]
    fn test_bad_arguments() {
        assert!(envelopes(&args(&[])).is_err());
        assert!(envelopes(&args(&["metadata", "a.png", "Colour", "red"])).is_err());
    }
}
