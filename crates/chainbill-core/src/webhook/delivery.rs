//! Webhook delivery worker and dead-letter consumer.
//!
//! Delivery is an HTTP POST of the exact signed payload bytes. Success is a
//! 2xx within the configured deadline; anything else re-enters the queue
//! with exponential backoff until the attempt budget is spent, after which
//! the message routes to the dead-letter queue. The DLQ consumer logs and
//! acks; there is no automatic reprocessing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryRetryConfig;
use crate::error::Result;
use crate::queue::{backoff_delay, pop_json, push_json_delayed, MessageQueue, WebhookDeliveryMessage};
use crate::store::Store;

/// Signature header carried on every delivery.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// What happened to one delivery attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Re-enqueued with the given delay.
    Retried(Duration),
    DeadLettered,
}

/// Queue consumer delivering webhook messages to merchant endpoints.
pub struct DeliveryWorker {
    http: reqwest::Client,
    queue: Arc<dyn MessageQueue>,
    dead_letters: Arc<dyn MessageQueue>,
    store: Arc<dyn Store>,
    config: DeliveryRetryConfig,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        dead_letters: Arc<dyn MessageQueue>,
        store: Arc<dyn Store>,
        config: DeliveryRetryConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            http,
            queue,
            dead_letters,
            store,
            config,
        }
    }

    /// Deliver one message, applying retry/dead-letter policy.
    pub async fn deliver(&self, message: WebhookDeliveryMessage) -> Result<DeliveryOutcome> {
        let response = self
            .http
            .post(&message.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={}", message.signature))
            .body(message.payload.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                debug!(url = %message.url, "webhook delivered");
                self.store.touch_webhook(message.account_id).await.ok();
                return Ok(DeliveryOutcome::Delivered);
            }
            Ok(response) => {
                warn!(
                    url = %message.url,
                    status = response.status().as_u16(),
                    attempt = message.attempt,
                    "webhook endpoint rejected delivery"
                );
            }
            Err(err) => {
                warn!(url = %message.url, attempt = message.attempt, %err, "webhook delivery failed");
            }
        }

        let next_attempt = message.attempt + 1;
        if next_attempt >= self.config.max_attempts {
            error!(
                url = %message.url,
                attempts = next_attempt,
                "webhook delivery exhausted retries, dead-lettering"
            );
            let dead = WebhookDeliveryMessage {
                attempt: next_attempt,
                ..message
            };
            crate::queue::push_json(self.dead_letters.as_ref(), &dead).await?;
            return Ok(DeliveryOutcome::DeadLettered);
        }

        let delay = backoff_delay(&self.config, message.attempt);
        let retried = WebhookDeliveryMessage {
            attempt: next_attempt,
            ..message
        };
        push_json_delayed(
            self.queue.as_ref(),
            &retried,
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        )
        .await?;

        Ok(DeliveryOutcome::Retried(delay))
    }

    /// Worker loop; runs until the task is aborted.
    pub async fn run(self) {
        info!("webhook delivery worker started");
        loop {
            match pop_json::<WebhookDeliveryMessage>(self.queue.as_ref()).await {
                Ok(Some(message)) => {
                    if let Err(err) = self.deliver(message).await {
                        error!(%err, "webhook delivery pass failed");
                    }
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(500)).await,
                Err(err) => {
                    error!(%err, "failed to read webhook queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Terminal consumer for deliveries that exhausted their retries: log and
/// ack so the queue drains.
pub struct DeadLetterConsumer {
    dead_letters: Arc<dyn MessageQueue>,
}

impl DeadLetterConsumer {
    pub fn new(dead_letters: Arc<dyn MessageQueue>) -> Self {
        Self { dead_letters }
    }

    /// Drain one message if present; returns whether one was consumed.
    pub async fn consume_one(&self) -> Result<bool> {
        match pop_json::<WebhookDeliveryMessage>(self.dead_letters.as_ref()).await? {
            Some(message) => {
                error!(
                    url = %message.url,
                    account_id = message.account_id,
                    attempts = message.attempt,
                    emitted_at = message.timestamp,
                    "webhook permanently undeliverable"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn run(self) {
        info!("webhook dead-letter consumer started");
        loop {
            match self.consume_one().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(Duration::from_secs(5)).await,
                Err(err) => {
                    error!(%err, "failed to read dead-letter queue");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
