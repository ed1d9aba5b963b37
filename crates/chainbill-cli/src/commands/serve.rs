//! `chainbill serve` — run the background workers.
//!
//! Boots the timer dispatcher (with its database backstop), the order
//! consumers, the webhook delivery worker and the dead-letter consumer, then
//! waits for ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use chainbill_core::dunning::DunningPolicy;
use chainbill_core::processor::{OrderConsumer, OrderProcessor};
use chainbill_core::provider::{BaseProvider, ProviderRegistry};
use chainbill_core::queue::RedisQueue;
use chainbill_core::scheduler::{RedisScheduler, TimerDispatcher};
use chainbill_core::store::{create_pool, PostgresStore, Store};
use chainbill_core::webhook::{DeadLetterConsumer, DeliveryWorker, WebhookOutbox};
use chainbill_core::Config;

pub async fn run(config: Config, workers: usize) -> anyhow::Result<()> {
    let pool = create_pool(&config.database.url, config.database.pool_size)
        .await
        .context("failed to connect to database")?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));

    let redis_client =
        redis::Client::open(config.redis.url.as_str()).context("invalid redis url")?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .context("failed to connect to redis")?;

    let namespace = &config.redis.namespace;
    let order_queue = Arc::new(RedisQueue::new(redis_conn.clone(), namespace, "orders"));
    let order_dead_letters =
        Arc::new(RedisQueue::new(redis_conn.clone(), namespace, "orders:dead"));
    let webhook_queue = Arc::new(RedisQueue::new(redis_conn.clone(), namespace, "webhooks"));
    let webhook_dead_letters =
        Arc::new(RedisQueue::new(redis_conn.clone(), namespace, "webhooks:dead"));

    let scheduler = RedisScheduler::new(redis_conn, namespace);

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(BaseProvider::new(config.provider.base.clone())));
    let registry = Arc::new(registry);

    let outbox = Arc::new(WebhookOutbox::new(store.clone(), webhook_queue.clone()));
    let policy = DunningPolicy::new(
        config.dunning.max_attempts,
        config.dunning.retry_interval_days.clone(),
    );
    let processor = Arc::new(OrderProcessor::new(
        store.clone(),
        registry,
        Arc::new(scheduler.clone()),
        outbox,
        policy,
    ));

    let mut tasks = Vec::new();

    let dispatcher = TimerDispatcher::new(
        scheduler,
        store.clone(),
        order_queue.clone(),
        config.scheduler.clone(),
    );
    tasks.push(tokio::spawn(dispatcher.run()));

    for _ in 0..workers.max(1) {
        let consumer = OrderConsumer::new(
            processor.clone(),
            order_queue.clone(),
            order_dead_letters.clone(),
            config.webhooks.delivery.clone(),
        );
        tasks.push(tokio::spawn(consumer.run()));
    }

    let delivery = DeliveryWorker::new(
        webhook_queue,
        webhook_dead_letters.clone(),
        store,
        config.webhooks.delivery.clone(),
    );
    tasks.push(tokio::spawn(delivery.run()));

    tasks.push(tokio::spawn(DeadLetterConsumer::new(webhook_dead_letters).run()));

    info!(workers, "chainbill workers running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");

    for task in tasks {
        task.abort();
    }

    Ok(())
}
