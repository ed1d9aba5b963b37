//! Redis sorted-set timers with a single dispatcher.
//!
//! The timer set maps `order_id -> due_at` (ZADD on the same member replaces
//! the score atomically, which is exactly the re-arm semantic). A side hash
//! keeps the provider tag for the fire message. The dispatcher claims a due
//! member with ZREM — only one claimer sees 1 — then enqueues the
//! process-order message; if the enqueue fails the member is re-armed, so a
//! firing is never silently lost. The database claim tick backstops anything
//! that slips through a crash window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::queue::{push_json, MessageQueue, ProcessOrderMessage};
use crate::scheduler::OrderScheduler;
use crate::store::Store;

/// Redis-backed per-order timer.
#[derive(Clone)]
pub struct RedisScheduler {
    conn: ConnectionManager,
    timers_key: String,
    providers_key: String,
}

impl RedisScheduler {
    pub fn new(conn: ConnectionManager, namespace: &str) -> Self {
        Self {
            conn,
            timers_key: format!("{}:timers", namespace),
            providers_key: format!("{}:timers:providers", namespace),
        }
    }

    /// Due order ids up to `limit`, claimed for this caller.
    async fn claim_due(&self, limit: isize) -> Result<Vec<(i64, String)>> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.timers_key, "-inf", now, 0, limit)
            .await?;

        let mut claimed = Vec::new();
        for member in due {
            let removed: i64 = conn.zrem(&self.timers_key, &member).await?;
            if removed != 1 {
                continue; // another dispatcher won this one
            }
            let provider: Option<String> = conn.hget(&self.providers_key, &member).await?;
            let _: () = conn.hdel(&self.providers_key, &member).await?;

            match member.parse::<i64>() {
                Ok(order_id) => {
                    claimed.push((order_id, provider.unwrap_or_else(|| "base".to_string())))
                }
                Err(_) => warn!(member, "dropping malformed timer member"),
            }
        }

        Ok(claimed)
    }

    /// Put a claimed timer back, used when the fire could not be enqueued.
    async fn rearm(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        self.set(order_id, due_at, provider).await
    }
}

#[async_trait]
impl OrderScheduler for RedisScheduler {
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let member = order_id.to_string();
        // ZADD on an existing member replaces the score: atomic re-arm.
        let _: () = conn
            .zadd(&self.timers_key, &member, due_at.timestamp())
            .await?;
        let _: () = conn.hset(&self.providers_key, &member, provider).await?;
        Ok(())
    }

    async fn update(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        self.set(order_id, due_at, provider).await
    }

    async fn delete(&self, order_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let member = order_id.to_string();
        let _: () = conn.zrem(&self.timers_key, &member).await?;
        let _: () = conn.hdel(&self.providers_key, &member).await?;
        Ok(())
    }
}

/// Single dispatcher: promotes due timers onto the order queue and runs the
/// database backstop claim for orders whose timers were lost.
pub struct TimerDispatcher {
    scheduler: RedisScheduler,
    store: Arc<dyn Store>,
    order_queue: Arc<dyn MessageQueue>,
    config: SchedulerConfig,
}

impl TimerDispatcher {
    pub fn new(
        scheduler: RedisScheduler,
        store: Arc<dyn Store>,
        order_queue: Arc<dyn MessageQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            order_queue,
            config,
        }
    }

    /// One dispatcher tick; returns the number of firings enqueued.
    pub async fn tick(&self) -> Result<usize> {
        let mut fired = 0;

        for (order_id, provider) in self
            .scheduler
            .claim_due(self.config.claim_batch as isize)
            .await?
        {
            // CAS in the database so the backstop below (or a concurrent
            // firing) can never hand the same order to two consumers.
            match self.store.claim_order(order_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(order_id, "timer fired for unclaimable order, skipping");
                    continue;
                }
                Err(err) => {
                    error!(order_id, %err, "order claim failed, re-arming timer");
                    self.scheduler.rearm(order_id, Utc::now(), &provider).await?;
                    continue;
                }
            }

            let message = ProcessOrderMessage {
                order_id,
                provider: provider.clone(),
                attempt: 0,
            };
            if let Err(err) = push_json(self.order_queue.as_ref(), &message).await {
                error!(order_id, %err, "failed to enqueue fired timer, re-arming");
                self.scheduler.rearm(order_id, Utc::now(), &provider).await?;
                continue;
            }
            fired += 1;
        }

        // Backstop: pending orders past due whose timers were lost.
        let claimed = self
            .store
            .claim_due_orders(self.config.claim_batch)
            .await
            .map_err(crate::error::Error::from)?;
        for context in claimed {
            // The timer is gone or was never armed; the row is already in
            // `processing`, so the consumer will pick it up from here.
            self.scheduler.delete(context.order.id).await.ok();
            let message = ProcessOrderMessage {
                order_id: context.order.id,
                provider: context.provider.clone(),
                attempt: 0,
            };
            push_json(self.order_queue.as_ref(), &message).await?;
            fired += 1;
        }

        Ok(fired)
    }

    /// Dispatcher loop; runs until the task is aborted.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "timer dispatcher started"
        );
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            match self.tick().await {
                Ok(0) => {}
                Ok(fired) => info!(fired, "dispatched due orders"),
                Err(err) => error!(%err, "dispatcher tick failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
