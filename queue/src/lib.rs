pub mod redis;

pub use redis::RedisBus;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use errors::Result;
use errors::error::QueueError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(test)]
mod tests;

/// Action to take on a delivery: acknowledge, or fail it onto the
/// failed queue without requeue.
#[derive(Debug, Clone)]
pub enum AckAction {
    Ack,
    Nack(FailedMsg),
}

/// One settle instruction on its way from a `Delivery` handle back to
/// the bus backend: which queue, which entry, and what to do with it.
#[derive(Debug, Clone)]
pub struct Settle {
    pub queue: String,
    pub id: String,
    pub action: AckAction,
}

/// Structured record written to the failed queue, one per negatively
/// acknowledged delivery. Carries enough context to replay or diagnose
/// the message downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailedMsg {
    pub queue: String,
    pub error: String,
    pub desc: String,
    pub msg: String,
}

/// A message received from the bus. The stage owning it MUST settle it
/// exactly once with `ack()` or `nack()`; later calls are no-ops so
/// fanned-out handlers cannot double-settle.
#[derive(Clone)]
pub struct Delivery {
    pub payload: Arc<Vec<u8>>,
    pub id: String,
    pub queue: String,
    settle_tx: mpsc::Sender<Settle>,
    settled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("payload", &self.payload.len())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        payload: Arc<Vec<u8>>,
        id: String,
        queue: String,
        settle_tx: mpsc::Sender<Settle>,
    ) -> Self {
        Self {
            payload,
            id,
            queue,
            settle_tx,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    async fn settle(&self, action: AckAction) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.settle_tx
            .send(Settle {
                queue: self.queue.clone(),
                id: self.id.clone(),
                action,
            })
            .await
            .map_err(|e| QueueError::AckFailed(Box::new(e)).into())
    }

    pub async fn ack(&self) -> Result<()> {
        self.settle(AckAction::Ack).await
    }

    /// Routes the delivery onto the failed queue and settles it
    /// without requeue.
    pub async fn nack(&self, error: &str, desc: &str) -> Result<()> {
        let failed = FailedMsg {
            queue: self.queue.clone(),
            error: error.to_string(),
            desc: desc.to_string(),
            msg: String::from_utf8_lossy(&self.payload).into_owned(),
        };
        self.settle(AckAction::Nack(failed)).await
    }
}

/// The bus as the pipeline sees it. Queues are durable and declared
/// lazily; publishes are persistent; consumption is prefetch-bounded
/// with manual acknowledgement.
#[async_trait]
pub trait BusBackend: Send + Sync {
    /// Declare a durable queue by name so publishes to it survive
    /// until a consumer appears. Declaring an existing queue is a
    /// no-op.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Publish a message onto a named queue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Publish a message onto an exchange under a routing key.
    async fn publish_routed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<()>;

    /// Start consuming a queue. At most `prefetch` unsettled deliveries
    /// are buffered towards `sender` at any time.
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: usize,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<()>;

    /// Peek the newest records on the failed queue.
    async fn read_failed(&self, count: usize) -> Result<Vec<FailedMsg>>;
}

