use crate::{AckAction, BusBackend, Delivery, FailedMsg, Settle};
use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::redis::{AsyncCommands, FromRedisValue};
use errors::Result;
use errors::error::QueueError;
use log::{debug, error, info, warn};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long one blocking read waits for fresh entries before the
/// reader loop comes back around.
const READ_BLOCK_MS: usize = 5_000;

/// How often a reader checks its queue for entries whose consumer
/// stopped acking them.
const STALE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Entries re-claimed per stale scan. One batch per scan is plenty at
/// pipeline volumes; leftovers wait for the next scan.
const STALE_SCAN_BATCH: usize = 64;

/// Bus implementation on top of Redis streams. Every queue is a
/// durable stream read through one shared consumer group; a pending
/// entry is the unacked delivery. Each subscribed queue gets its own
/// reader task, which also re-delivers entries a crashed consumer
/// left pending. Settles flow back over a channel and are applied as
/// they arrive; a negative acknowledgement moves the failure record
/// onto the failed queue and acks the origin entry in one
/// transaction, so the message cannot vanish between the two.
pub struct RedisBus {
    pool: deadpool_redis::Pool,
    group_id: String,
    consumer_name: String,
    namespace: String,
    failed_key: String,
    stale_after_ms: u64,
    settle_tx: mpsc::Sender<Settle>,
}

impl RedisBus {
    pub fn new(url: &str, namespace: &str, failed_queue: &str) -> Result<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|_| QueueError::ConnectionFailed)?;

        let (settle_tx, settle_rx) = mpsc::channel::<Settle>(256);

        let bus = Self {
            pool,
            group_id: format!("{}:workers", namespace),
            consumer_name: uuid::Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            failed_key: Self::stream_key(namespace, failed_queue),
            stale_after_ms: 60_000,
            settle_tx,
        };

        bus.spawn_settler(settle_rx);

        Ok(bus)
    }

    fn stream_key(namespace: &str, queue: &str) -> String {
        format!("{{{}:{}}}", namespace, queue)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|_| QueueError::ConnectionFailed.into())
    }

    /// Applies every settle the moment it arrives. The pipeline moves
    /// a handful of messages per analyzer run, so there is nothing to
    /// batch; an ack lost to a transient error leaves the entry
    /// pending and the stale scan re-delivers it.
    fn spawn_settler(&self, mut settle_rx: mpsc::Receiver<Settle>) {
        let pool = self.pool.clone();
        let group_id = self.group_id.clone();
        let namespace = self.namespace.clone();
        let failed_key = self.failed_key.clone();

        tokio::spawn(async move {
            while let Some(settle) = settle_rx.recv().await {
                let key = Self::stream_key(&namespace, &settle.queue);

                let mut conn = match pool.get().await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(
                            "No connection to settle {} on {}: {}",
                            settle.id, settle.queue, e
                        );
                        continue;
                    }
                };

                match settle.action {
                    AckAction::Ack => {
                        let res: redis::RedisResult<i64> =
                            conn.xack(&key, &group_id, &[settle.id.as_str()]).await;
                        match res {
                            Ok(_) => {
                                counter!("bus_ack_total", "queue" => settle.queue.clone())
                                    .increment(1);
                            }
                            Err(e) => warn!(
                                "Ack of {} on {} failed, entry stays pending: {}",
                                settle.id, settle.queue, e
                            ),
                        }
                    }
                    AckAction::Nack(failed) => {
                        let record = match serde_json::to_vec(&failed) {
                            Ok(r) => r,
                            Err(e) => {
                                error!("Unencodable failure record for {}: {}", settle.queue, e);
                                continue;
                            }
                        };

                        // Record and ack go through one transaction:
                        // either the entry moves to the failed queue
                        // or it stays pending.
                        let res: redis::RedisResult<()> = redis::pipe()
                            .atomic()
                            .cmd("XADD")
                            .arg(&failed_key)
                            .arg("*")
                            .arg("payload")
                            .arg(record.as_slice())
                            .ignore()
                            .cmd("XACK")
                            .arg(&key)
                            .arg(&group_id)
                            .arg(settle.id.as_str())
                            .ignore()
                            .query_async(&mut conn)
                            .await;

                        match res {
                            Ok(()) => {
                                counter!("bus_failed_total", "queue" => settle.queue.clone())
                                    .increment(1);
                            }
                            Err(e) => warn!(
                                "Failure record for {} on {} not written, entry stays pending: {}",
                                settle.id, settle.queue, e
                            ),
                        }
                    }
                }
            }
            info!("Settle channel closed");
        });
    }

    async fn ensure_group(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(key, &self.group_id, "$")
            .await
        {
            Ok(()) => debug!("Declared {} with group {}", key, self.group_id),
            // Someone got there first, same thing.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(QueueError::OperationFailed(Box::new(e)).into()),
        }
        Ok(())
    }
}

/// Reader task owning one subscribed queue. Low and bursty traffic
/// across three queues makes a task per queue simpler and no less
/// efficient than multiplexing them over one connection.
struct QueueReader {
    pool: deadpool_redis::Pool,
    key: String,
    queue: String,
    group_id: String,
    consumer: String,
    prefetch: usize,
    stale_after_ms: u64,
    sender: mpsc::Sender<Delivery>,
    settle_tx: mpsc::Sender<Settle>,
}

impl QueueReader {
    async fn run(self) {
        info!("Consuming {} as {}", self.queue, self.consumer);

        // No scan timestamp yet: the first loop turn scans, so
        // entries orphaned by an earlier process are picked up right
        // after a restart.
        let mut last_scan: Option<Instant> = None;

        loop {
            let mut conn = match self.pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    warn!("No connection for {}: {}", self.queue, e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if last_scan.is_none_or(|t| t.elapsed() >= STALE_SCAN_INTERVAL) {
                if !self.scan_stale(&mut conn).await {
                    return;
                }
                last_scan = Some(Instant::now());
            }

            let opts = redis::streams::StreamReadOptions::default()
                .group(&self.group_id, &self.consumer)
                .count(self.prefetch)
                .block(READ_BLOCK_MS);
            let reply: redis::RedisResult<redis::streams::StreamReadReply> =
                conn.xread_options(&[self.key.as_str()], &[">"], &opts).await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Read on {} failed: {}", self.queue, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for stream in reply.keys {
                for entry in stream.ids {
                    let Some(msg) = self.into_delivery(entry.id, &entry.map) else {
                        debug!("Entry without payload on {}", self.queue);
                        continue;
                    };
                    counter!("bus_consume_total", "queue" => self.queue.clone()).increment(1);
                    if self.sender.send(msg).await.is_err() {
                        warn!("Consumer of {} went away, reader stops", self.queue);
                        return;
                    }
                }
            }
        }
    }

    /// Re-delivers entries whose consumer stopped acking them.
    /// Returns false once the subscriber is gone.
    async fn scan_stale(&self, conn: &mut deadpool_redis::Connection) -> bool {
        type ClaimedEntries = Vec<(String, HashMap<String, redis::Value>)>;

        let reply: redis::RedisResult<(String, ClaimedEntries, redis::Value)> =
            redis::cmd("XAUTOCLAIM")
                .arg(&self.key)
                .arg(&self.group_id)
                .arg(&self.consumer)
                .arg(self.stale_after_ms)
                .arg("0-0")
                .arg("COUNT")
                .arg(STALE_SCAN_BATCH)
                .query_async(conn)
                .await;

        let entries = match reply {
            Ok((_cursor, entries, _deleted)) => entries,
            Err(e) => {
                warn!("Stale scan on {} failed: {}", self.queue, e);
                return true;
            }
        };

        if entries.is_empty() {
            return true;
        }

        warn!(
            "Re-delivering {} stalled entries on {}",
            entries.len(),
            self.queue
        );
        counter!("bus_redelivered_total", "queue" => self.queue.clone())
            .increment(entries.len() as u64);

        for (id, fields) in entries {
            if let Some(msg) = self.into_delivery(id, &fields)
                && self.sender.send(msg).await.is_err()
            {
                return false;
            }
        }

        true
    }

    fn into_delivery(&self, id: String, fields: &HashMap<String, redis::Value>) -> Option<Delivery> {
        let payload = fields
            .get("payload")
            .and_then(|v| Vec::<u8>::from_redis_value(v).ok())?;
        Some(Delivery::new(
            Arc::new(payload),
            id,
            self.queue.clone(),
            self.settle_tx.clone(),
        ))
    }
}

#[async_trait]
impl BusBackend for RedisBus {
    async fn declare(&self, queue: &str) -> Result<()> {
        let key = Self::stream_key(&self.namespace, queue);
        self.ensure_group(&key).await
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = Self::stream_key(&self.namespace, queue);

        let _: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PushFailed(Box::new(e)))?;

        counter!("bus_publish_total", "queue" => queue.to_string()).increment(1);
        debug!("Dispatched {} bytes to {}", payload.len(), queue);
        Ok(())
    }

    async fn publish_routed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = Self::stream_key(&self.namespace, exchange);

        let _: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .arg("h:routing_key")
            .arg(routing_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PushFailed(Box::new(e)))?;

        counter!("bus_publish_total", "queue" => exchange.to_string()).increment(1);
        debug!(
            "Dispatched {} bytes to {} ({})",
            payload.len(),
            exchange,
            routing_key
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<()> {
        let key = Self::stream_key(&self.namespace, queue);
        self.ensure_group(&key).await?;

        let reader = QueueReader {
            pool: self.pool.clone(),
            key,
            queue: queue.to_string(),
            group_id: self.group_id.clone(),
            consumer: format!("{}:{}", self.consumer_name, queue),
            prefetch: prefetch.max(1),
            stale_after_ms: self.stale_after_ms,
            sender,
            settle_tx: self.settle_tx.clone(),
        };
        tokio::spawn(reader.run());

        Ok(())
    }

    async fn read_failed(&self, count: usize) -> Result<Vec<FailedMsg>> {
        let mut conn = self.get_connection().await?;

        let result: redis::RedisResult<Vec<(String, HashMap<String, Vec<u8>>)>> =
            redis::cmd("XREVRANGE")
                .arg(&self.failed_key)
                .arg("+")
                .arg("-")
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await;

        match result {
            Ok(entries) => {
                let mut output = Vec::new();
                for (id, map) in entries {
                    let Some(record) = map.get("payload") else {
                        continue;
                    };
                    match serde_json::from_slice::<FailedMsg>(record) {
                        Ok(failed) => output.push(failed),
                        Err(e) => warn!("Skipping unreadable failure record {}: {}", id, e),
                    }
                }
                Ok(output)
            }
            Err(e) => {
                warn!("Error reading failed queue {}: {}", self.failed_key, e);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod redis_tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(
            RedisBus::stream_key("totem", "totem-dynamic-check-mal"),
            "{totem:totem-dynamic-check-mal}"
        );
        assert_eq!(RedisBus::stream_key("totem", "totem_output"), "{totem:totem_output}");
    }
}
