//! Message queues for order processing and webhook delivery.
//!
//! The engine consumes queues through the [`MessageQueue`] interface; it does
//! not implement its own broker. The Redis implementation pairs a list with a
//! sorted set for delayed redelivery; the in-memory implementation backs the
//! test suites.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::DeliveryRetryConfig;
use crate::error::{Error, Result};

/// Message driving one `process_order` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOrderMessage {
    pub order_id: i64,
    pub provider: String,
    /// Redelivery count for upstream-error backoff.
    #[serde(default)]
    pub attempt: u32,
}

/// One signed webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryMessage {
    pub url: String,
    /// Exact body bytes that were signed.
    pub payload: String,
    /// Lowercase hex HMAC-SHA-256 of `payload`.
    pub signature: String,
    /// Account whose webhook this is, for last-used bookkeeping.
    pub account_id: i64,
    /// Unix seconds at emission.
    pub timestamp: i64,
    #[serde(default)]
    pub attempt: u32,
}

/// Exponential backoff delay for a redelivery attempt (0-based).
pub fn backoff_delay(config: &DeliveryRetryConfig, attempt: u32) -> Duration {
    let factor = u64::from(config.multiplier).saturating_pow(attempt);
    let delay = config.base_delay_secs.saturating_mul(factor);
    Duration::from_secs(delay.min(config.max_delay_secs))
}

/// Queue transport contract.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue for immediate delivery.
    async fn push(&self, payload: String) -> Result<()>;

    /// Enqueue for delivery at or after `deliver_at`.
    async fn push_delayed(&self, payload: String, deliver_at: DateTime<Utc>) -> Result<()>;

    /// Pop one message, promoting due delayed messages first. Non-blocking.
    async fn pop(&self) -> Result<Option<String>>;
}

/// Push a serialisable message.
pub async fn push_json<T: Serialize + Sync>(queue: &dyn MessageQueue, message: &T) -> Result<()> {
    queue.push(serde_json::to_string(message)?).await
}

/// Push a serialisable message with a delay.
pub async fn push_json_delayed<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    message: &T,
    deliver_at: DateTime<Utc>,
) -> Result<()> {
    queue
        .push_delayed(serde_json::to_string(message)?, deliver_at)
        .await
}

/// Redis-backed queue: `LPUSH`/`RPOP` list plus a `(deliver_at, payload)`
/// sorted set that [`MessageQueue::pop`] promotes from.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    list_key: String,
    delayed_key: String,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, namespace: &str, name: &str) -> Self {
        Self {
            conn,
            list_key: format!("{}:queue:{}", namespace, name),
            delayed_key: format!("{}:queue:{}:delayed", namespace, name),
        }
    }

    async fn promote_due(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.delayed_key, "-inf", now, 0, 100)
            .await?;

        for payload in due {
            // ZREM returns 1 for exactly one claimer; only the winner pushes.
            let removed: i64 = conn.zrem(&self.delayed_key, &payload).await?;
            if removed == 1 {
                let _: () = conn.lpush(&self.list_key, &payload).await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn push(&self, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.list_key, payload).await?;
        Ok(())
    }

    async fn push_delayed(&self, payload: String, deliver_at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(&self.delayed_key, payload, deliver_at.timestamp())
            .await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        self.promote_due().await?;

        let mut conn = self.conn.clone();
        let popped: Option<String> = conn.rpop(&self.list_key, None::<NonZeroUsize>).await?;
        Ok(popped)
    }
}

/// In-memory queue for tests and local runs.
#[derive(Default)]
pub struct MemoryQueue {
    ready: Mutex<VecDeque<String>>,
    delayed: Mutex<Vec<(DateTime<Utc>, String)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of immediately deliverable messages.
    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    /// Number of messages waiting on a delay.
    pub fn delayed_len(&self) -> usize {
        self.delayed.lock().unwrap().len()
    }

    /// Move every delayed message to the ready queue regardless of time.
    /// Test hook for driving redelivery without sleeping.
    pub fn promote_all(&self) {
        let mut delayed = self.delayed.lock().unwrap();
        let mut ready = self.ready.lock().unwrap();
        for (_, payload) in delayed.drain(..) {
            ready.push_back(payload);
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn push(&self, payload: String) -> Result<()> {
        self.ready.lock().unwrap().push_back(payload);
        Ok(())
    }

    async fn push_delayed(&self, payload: String, deliver_at: DateTime<Utc>) -> Result<()> {
        self.delayed.lock().unwrap().push((deliver_at, payload));
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>> {
        let now = Utc::now();
        {
            let mut delayed = self.delayed.lock().unwrap();
            let mut ready = self.ready.lock().unwrap();
            let mut index = 0;
            while index < delayed.len() {
                if delayed[index].0 <= now {
                    let (_, payload) = delayed.remove(index);
                    ready.push_back(payload);
                } else {
                    index += 1;
                }
            }
        }

        Ok(self.ready.lock().unwrap().pop_front())
    }
}

/// Pop and decode one message.
pub async fn pop_json<T: for<'de> Deserialize<'de>>(
    queue: &dyn MessageQueue,
) -> Result<Option<T>> {
    match queue.pop().await? {
        Some(payload) => {
            let message = serde_json::from_str(&payload)
                .map_err(|e| Error::queue(format!("undecodable message: {}", e)))?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let config = DeliveryRetryConfig::default();
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(320));
        // Capped at 600s from the 7th retry on
        assert_eq!(backoff_delay(&config, 7), Duration::from_secs(600));
        assert_eq!(backoff_delay(&config, 9), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryQueue::new();
        queue.push("a".into()).await.unwrap();
        queue.push("b".into()).await.unwrap();

        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_queue_delay() {
        let queue = MemoryQueue::new();
        queue
            .push_delayed("later".into(), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(queue.pop().await.unwrap(), None);
        assert_eq!(queue.delayed_len(), 1);

        queue.promote_all();
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("later"));
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let queue = MemoryQueue::new();
        let message = ProcessOrderMessage {
            order_id: 7,
            provider: "base".into(),
            attempt: 2,
        };
        push_json(&queue, &message).await.unwrap();

        let decoded: ProcessOrderMessage = pop_json(&queue).await.unwrap().unwrap();
        assert_eq!(decoded.order_id, 7);
        assert_eq!(decoded.attempt, 2);
    }
}
