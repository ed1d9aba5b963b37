//! Webhook outbox (C6)
//!
//! Formats, signs and enqueues `subscription.updated` events for the
//! lifecycle edges. Emission never propagates failures to the caller: a
//! merchant without an (enabled) webhook is a no-op, and transport problems
//! are logged and swallowed. Delivery itself lives in [`delivery`].

pub mod delivery;
pub mod event;
pub mod signature;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{ErrorCode, Result};
use crate::models::{Order, Subscription, SubscriptionStatus, Transaction};
use crate::queue::{push_json, MessageQueue, WebhookDeliveryMessage};
use crate::store::Store;

pub use delivery::{DeadLetterConsumer, DeliveryWorker};
pub use event::{
    ErrorEventData, OrderEventData, SubscriptionEventData, TransactionEventData, WebhookEvent,
    WebhookEventData, EVENT_TYPE,
};

/// Webhook event producer.
pub struct WebhookOutbox {
    store: Arc<dyn Store>,
    queue: Arc<dyn MessageQueue>,
}

impl WebhookOutbox {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { store, queue }
    }

    /// Subscription registered, activation pending.
    pub async fn subscription_created(&self, subscription: &Subscription, order: &Order) {
        self.emit(
            subscription,
            SubscriptionStatus::Processing,
            Some(order),
            None,
            None,
            None,
        )
        .await;
    }

    /// Activation charge settled.
    pub async fn subscription_activated(
        &self,
        subscription: &Subscription,
        order: &Order,
        transaction: &Transaction,
    ) {
        self.emit(
            subscription,
            SubscriptionStatus::Active,
            Some(order),
            Some(transaction),
            None,
            None,
        )
        .await;
    }

    /// Recurring charge settled.
    pub async fn payment_processed(
        &self,
        subscription: &Subscription,
        order: &Order,
        transaction: &Transaction,
    ) {
        self.emit(
            subscription,
            SubscriptionStatus::Active,
            Some(order),
            Some(transaction),
            None,
            None,
        )
        .await;
    }

    /// Charge failed; `status` is the post-dunning subscription status.
    pub async fn payment_failed(
        &self,
        subscription: &Subscription,
        status: SubscriptionStatus,
        order: &Order,
        code: ErrorCode,
        message: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.emit(
            subscription,
            status,
            Some(order),
            None,
            Some(ErrorEventData::sanitized(code, message)),
            next_retry_at.map(|t| t.timestamp()),
        )
        .await;
    }

    /// Activation charge failed; the subscription is now `incomplete`.
    pub async fn activation_failed(
        &self,
        subscription: &Subscription,
        order: &Order,
        code: ErrorCode,
        message: &str,
    ) {
        self.emit(
            subscription,
            SubscriptionStatus::Incomplete,
            Some(order),
            None,
            Some(ErrorEventData::sanitized(code, message)),
            None,
        )
        .await;
    }

    /// Subscription revoked or terminally canceled.
    pub async fn subscription_canceled(
        &self,
        subscription: &Subscription,
        last_order: Option<&Order>,
    ) {
        self.emit(
            subscription,
            SubscriptionStatus::Canceled,
            last_order,
            None,
            None,
            None,
        )
        .await;
    }

    async fn emit(
        &self,
        subscription: &Subscription,
        status: SubscriptionStatus,
        order: Option<&Order>,
        transaction: Option<&Transaction>,
        error: Option<ErrorEventData>,
        next_retry_at: Option<i64>,
    ) {
        if let Err(err) = self
            .try_emit(subscription, status, order, transaction, error, next_retry_at)
            .await
        {
            warn!(
                subscription_id = %subscription.subscription_id,
                status = %status,
                %err,
                "webhook emission failed"
            );
        }
    }

    async fn try_emit(
        &self,
        subscription: &Subscription,
        status: SubscriptionStatus,
        order: Option<&Order>,
        transaction: Option<&Transaction>,
        error: Option<ErrorEventData>,
        next_retry_at: Option<i64>,
    ) -> Result<()> {
        let webhook = match self.store.get_webhook(subscription.account_id).await? {
            Some(webhook) if webhook.is_active() => webhook,
            _ => {
                debug!(
                    account_id = subscription.account_id,
                    "no active webhook, skipping emission"
                );
                return Ok(());
            }
        };

        let now = Utc::now().timestamp();
        let event = WebhookEvent {
            event_type: EVENT_TYPE.to_string(),
            created_at: now,
            data: WebhookEventData {
                subscription: SubscriptionEventData::build(subscription, status, order),
                order: order.map(|o| OrderEventData::build(o, next_retry_at)),
                transaction: transaction.map(TransactionEventData::from),
                error,
            },
        };

        // Compact serialisation; these exact bytes are what gets signed and
        // what the merchant must verify against.
        let payload = serde_json::to_string(&event)?;
        let sig = signature::sign(&webhook.secret, payload.as_bytes());

        push_json(
            self.queue.as_ref(),
            &WebhookDeliveryMessage {
                url: webhook.url,
                payload,
                signature: sig,
                account_id: subscription.account_id,
                timestamp: now,
                attempt: 0,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType, Webhook};
    use crate::queue::{pop_json, MemoryQueue};
    use crate::store::MemoryStore;

    const SUB: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

    fn subscription(account_id: i64) -> Subscription {
        Subscription {
            subscription_id: SUB.to_string(),
            status: SubscriptionStatus::Processing,
            account_id,
            beneficiary_address: "0x00000000000000000000000000000000000000aa".into(),
            provider: "base".into(),
            testnet: false,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    fn order() -> Order {
        Order {
            id: 1,
            subscription_id: SUB.to_string(),
            order_number: 1,
            order_type: OrderType::Initial,
            due_at: Utc::now(),
            amount: "500000".into(),
            period_length_in_seconds: 2_592_000,
            status: OrderStatus::Processing,
            attempts: 0,
            parent_order_id: None,
            next_retry_at: None,
            failure_reason: None,
            raw_error: None,
            created_at: Utc::now(),
        }
    }

    async fn outbox_with_webhook() -> (WebhookOutbox, Arc<MemoryQueue>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_webhook(Webhook {
                account_id: 1,
                url: "https://merchant.example/hooks".into(),
                secret: "whsec_test".into(),
                enabled: true,
                deleted: false,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await
            .unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let outbox = WebhookOutbox::new(store.clone(), queue.clone());
        (outbox, queue, store)
    }

    #[tokio::test]
    async fn test_emission_signs_payload() {
        let (outbox, queue, _) = outbox_with_webhook().await;
        outbox.subscription_created(&subscription(1), &order()).await;

        let message: WebhookDeliveryMessage = pop_json(queue.as_ref()).await.unwrap().unwrap();
        assert_eq!(message.url, "https://merchant.example/hooks");
        assert!(signature::verify(
            "whsec_test",
            message.payload.as_bytes(),
            &message.signature
        ));

        let event: WebhookEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(event.event_type, EVENT_TYPE);
        assert_eq!(event.data.subscription.status, "processing");
        assert_eq!(event.data.order.as_ref().unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_no_webhook_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let outbox = WebhookOutbox::new(store, queue.clone());

        outbox.subscription_created(&subscription(1), &order()).await;
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_webhook_is_noop() {
        let (outbox, queue, store) = outbox_with_webhook().await;
        store
            .upsert_webhook(Webhook {
                account_id: 1,
                url: "https://merchant.example/hooks".into(),
                secret: "whsec_test".into(),
                enabled: false,
                deleted: false,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .await
            .unwrap();

        outbox.subscription_created(&subscription(1), &order()).await;
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn test_payment_failed_carries_retry_and_sanitized_error() {
        let (outbox, queue, _) = outbox_with_webhook().await;
        let retry_at = Utc::now() + chrono::Duration::days(2);

        outbox
            .payment_failed(
                &subscription(1),
                SubscriptionStatus::PastDue,
                &order(),
                ErrorCode::InsufficientBalance,
                "transfer amount exceeds balance",
                Some(retry_at),
            )
            .await;

        let message: WebhookDeliveryMessage = pop_json(queue.as_ref()).await.unwrap().unwrap();
        let event: WebhookEvent = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(event.data.subscription.status, "past_due");
        assert_eq!(
            event.data.order.as_ref().unwrap().next_retry_at,
            Some(retry_at.timestamp())
        );
        let error = event.data.error.as_ref().unwrap();
        assert_eq!(error.code, "INSUFFICIENT_BALANCE");

        // Non-exposable errors are replaced
        outbox
            .activation_failed(
                &subscription(1),
                &order(),
                ErrorCode::UpstreamServiceError,
                "bundler 503",
            )
            .await;
        let message: WebhookDeliveryMessage = pop_json(queue.as_ref()).await.unwrap().unwrap();
        let event: WebhookEvent = serde_json::from_str(&message.payload).unwrap();
        let error = event.data.error.as_ref().unwrap();
        assert_eq!(error.code, "internal_error");
        assert_eq!(error.message, "An internal error occurred");
    }
}
