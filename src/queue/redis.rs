//! Redis Streams queue back end.
//!
//! Each queue is a stream read through a consumer group:
//!
//! ```text
//! send          XADD <stream> * envelope <json> receiveCount <n>
//! receive       XAUTOCLAIM entries idle longer than the visibility timeout
//!               (treated as expired deliveries), then XREADGROUP ... >
//! ack           XACK + XDEL
//! nack          XADD a copy with the new receiveCount, then XACK + XDEL
//! ```
//!
//! `receiveCount` on a stream entry counts the receives that happened before
//! the entry was written; the delivery handed to a consumer reports one more.

use super::{Delivery, MessageQueue, NackOutcome, QueueError};
use crate::dlq::RedrivePolicy;
use crate::event::Envelope;
use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Connection, Pool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time a received entry stays claimed before another consumer may take it.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A queue stored in a Redis stream.
pub struct RedisStreamQueue {
    name: String,
    stream: String,
    group: String,
    consumer: String,
    pool: Pool,
    visibility_timeout: Duration,
    redrive: RedrivePolicy,
}

impl RedisStreamQueue {
    /// Open the queue, creating the stream and consumer group if needed.
    pub async fn connect(
        pool: Pool,
        name: impl Into<String>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            name: name.into(),
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            pool,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            redrive: RedrivePolicy::unbounded(),
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = policy;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    async fn connection(&self) -> Result<Connection, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e.to_string())),
        }
    }

    async fn append(&self, conn: &mut Connection, envelope: &Envelope, receive_count: u32) -> Result<String, QueueError> {
        let json = envelope.to_json()?;
        cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("envelope")
            .arg(json)
            .arg("receiveCount")
            .arg(receive_count)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))
    }

    /// Acknowledge and delete an entry. Returns false if it was not pending.
    async fn remove(&self, conn: &mut Connection, id: &str) -> Result<bool, QueueError> {
        let acked: u64 = conn
            .xack(&self.stream, &self.group, &[id])
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;
        let _: u64 = conn
            .xdel(&self.stream, &[id])
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;
        Ok(acked > 0)
    }

    async fn settle(&self, conn: &mut Connection, delivery: &Delivery) -> Result<(), QueueError> {
        if self.remove(conn, &delivery.receipt).await? {
            Ok(())
        } else {
            Err(QueueError::StaleReceipt(delivery.receipt.clone()))
        }
    }

    /// Take over entries whose consumer did not settle them in time and
    /// requeue or dead-letter them.
    async fn reclaim_expired(&self, conn: &mut Connection, max: usize) -> Result<usize, QueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as u64;

        let reply: RedisValue = match cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(max.max(1))
            .query_async(&mut *conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                // XAUTOCLAIM needs Redis 6.2+
                debug!(error = %e, "XAUTOCLAIM failed, skipping expired delivery recovery");
                return Ok(0);
            }
        };

        let entries = parse_autoclaim(&reply);
        let reclaimed = entries.len();

        for (id, fields) in entries {
            let Some(stored) = parse_entry(&fields) else {
                warn!(stream = %self.stream, id = %id, "Dropping unparseable stream entry");
                self.remove(conn, &id).await?;
                continue;
            };
            // The expired delivery counted as one receive
            let receive_count = stored.1 + 1;

            if self.redrive.is_exhausted(receive_count) {
                self.redrive
                    .dead_letter(&self.name, &stored.0, receive_count, "visibility timeout expired")
                    .await?;
            } else {
                self.append(conn, &stored.0, receive_count).await?;
            }
            self.remove(conn, &id).await?;
        }

        if reclaimed > 0 {
            info!(queue = %self.name, count = reclaimed, "Recovered expired deliveries");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let id = self.append(&mut conn, &envelope, 0).await?;
        debug!(queue = %self.name, id = %id, message_id = %envelope.message_id, "Message sent");
        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        self.reclaim_expired(&mut conn, max).await?;

        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        let block_ms = wait.as_millis() as usize;
        if block_ms > 0 {
            opts = opts.block(block_ms);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        let mut deliveries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for element in key.ids {
                let fields: HashMap<String, String> = element
                    .map
                    .iter()
                    .filter_map(|(k, v)| value_to_string(v).map(|s| (k.clone(), s)))
                    .collect();

                match parse_entry(&fields) {
                    Some((envelope, previous_receives)) => deliveries.push(Delivery {
                        envelope,
                        receipt: element.id,
                        receive_count: previous_receives + 1,
                    }),
                    None => {
                        warn!(stream = %self.stream, id = %element.id, "Dropping unparseable stream entry");
                        self.remove(&mut conn, &element.id).await?;
                    }
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        self.settle(&mut conn, delivery).await
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError> {
        let mut conn = self.connection().await?;

        let outcome = if self.redrive.is_exhausted(delivery.receive_count) {
            self.redrive
                .dead_letter(&self.name, &delivery.envelope, delivery.receive_count, reason)
                .await?
        } else {
            self.append(&mut conn, &delivery.envelope, delivery.receive_count).await?;
            debug!(
                queue = %self.name,
                message_id = %delivery.envelope.message_id,
                receive_count = delivery.receive_count,
                reason = %reason,
                "Message requeued"
            );
            NackOutcome::Requeued
        };

        self.settle(&mut conn, delivery).await?;
        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, QueueError> {
        let mut conn = self.connection().await?;
        let outcome = self
            .redrive
            .dead_letter(&self.name, &delivery.envelope, delivery.receive_count, reason)
            .await?;
        self.settle(&mut conn, delivery).await?;
        Ok(outcome)
    }

    async fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let len: usize = cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;
        Ok(len)
    }
}

/// Extract a string from a Redis reply value.
fn value_to_string(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Decode the envelope and prior receive count of a stream entry.
fn parse_entry(fields: &HashMap<String, String>) -> Option<(Envelope, u32)> {
    let envelope = Envelope::from_json(fields.get("envelope")?).ok()?;
    let receive_count = fields
        .get("receiveCount")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    Some((envelope, receive_count))
}

/// Parse an `XAUTOCLAIM` reply into `(id, fields)` pairs.
///
/// The reply is `[next-id, [[id, [k, v, ...]], ...], (deleted-ids)]`; entries
/// deleted while pending come back as nil on Redis 6.2 and are skipped.
fn parse_autoclaim(reply: &RedisValue) -> Vec<(String, HashMap<String, String>)> {
    let RedisValue::Array(parts) = reply else {
        return Vec::new();
    };
    let Some(RedisValue::Array(entries)) = parts.get(1) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let RedisValue::Array(pair) = entry else {
                return None;
            };
            let id = value_to_string(pair.first()?)?;
            let RedisValue::Array(flat) = pair.get(1)? else {
                return None;
            };
            let fields = flat
                .chunks(2)
                .filter_map(|kv| match kv {
                    [k, v] => Some((value_to_string(k)?, value_to_string(v)?)),
                    _ => None,
                })
                .collect();
            Some((id, fields))
        })
        .collect()
}
